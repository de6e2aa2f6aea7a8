pub mod range_breakout;
