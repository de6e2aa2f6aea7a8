pub mod stats;

pub use stats::EngineStats;
