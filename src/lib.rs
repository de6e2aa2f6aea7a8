//! Opening-range breakout execution engine.
//!
//! One state machine per (trading date, stream) builds a range from the
//! session open to a slot time, locks it, and enters at most once on the first
//! breakout with protective stop and target legs. Everything that must survive
//! a restart lives in the journals; everything else is rebuilt from bars.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod hydration;
pub mod instrument;
pub mod intent;
pub mod journal;
pub mod metrics;
pub mod risk;
pub mod strategy;
pub mod stream;
pub mod time;
pub mod types;

pub use crate::config::EngineConfig;
pub use crate::engine::{Engine, EngineDeps, Timetable, TimetableEntry};
