//! Pre-submission gate.
//!
//! The gate is stateless: every input is read at evaluation time. The kill
//! switch fails closed, so a missing or unreadable switch blocks execution.

use chrono::NaiveTime;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::stream::state::StreamState;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KillSwitchError {
    #[error("kill switch source missing: {0}")]
    Missing(String),
    #[error("kill switch source unreadable: {0}")]
    Unreadable(String),
}

/// Single global trading halt, polled before every submission.
pub trait KillSwitch: Send + Sync {
    /// `Ok(true)` means trading is halted.
    fn engaged(&self) -> Result<bool, KillSwitchError>;
}

/// Reads `{"enabled": bool}` from a file on every poll.
#[derive(Clone, Debug)]
pub struct FileKillSwitch {
    path: PathBuf,
}

#[derive(Deserialize)]
struct KillSwitchFile {
    enabled: bool,
}

impl FileKillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KillSwitch for FileKillSwitch {
    fn engaged(&self) -> Result<bool, KillSwitchError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KillSwitchError::Missing(self.path.display().to_string()),
            _ => KillSwitchError::Unreadable(e.to_string()),
        })?;
        let parsed: KillSwitchFile =
            serde_json::from_str(&text).map_err(|e| KillSwitchError::Unreadable(e.to_string()))?;
        Ok(parsed.enabled)
    }
}

/// In-process switch.
#[derive(Debug, Default)]
pub struct StaticKillSwitch(AtomicBool);

impl StaticKillSwitch {
    pub fn new(engaged: bool) -> Self {
        Self(AtomicBool::new(engaged))
    }

    pub fn set(&self, engaged: bool) {
        self.0.store(engaged, Ordering::SeqCst);
    }
}

impl KillSwitch for StaticKillSwitch {
    fn engaged(&self) -> Result<bool, KillSwitchError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateBlock {
    KillSwitchEngaged,
    KillSwitchUnreadable(String),
    TimetableInvalid,
    StreamNotArmed(StreamState),
    SlotNotAllowed(NaiveTime),
    InstrumentBlocked,
}

/// Inputs for one evaluation.
pub struct GateInputs<'a> {
    pub kill_switch: &'a dyn KillSwitch,
    pub timetable_valid: bool,
    pub stream_state: StreamState,
    pub entry_already_detected: bool,
    pub slot_time: NaiveTime,
    pub allowed_slots: &'a [NaiveTime],
    pub instrument_blocked: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RiskGate;

impl RiskGate {
    pub fn evaluate(&self, inputs: &GateInputs<'_>) -> Result<(), GateBlock> {
        match inputs.kill_switch.engaged() {
            Ok(false) => {}
            Ok(true) => return Err(GateBlock::KillSwitchEngaged),
            Err(e) => return Err(GateBlock::KillSwitchUnreadable(e.to_string())),
        }
        if !inputs.timetable_valid {
            return Err(GateBlock::TimetableInvalid);
        }
        if inputs.stream_state != StreamState::RangeLocked || inputs.entry_already_detected {
            return Err(GateBlock::StreamNotArmed(inputs.stream_state));
        }
        if !inputs.allowed_slots.contains(&inputs.slot_time) {
            return Err(GateBlock::SlotNotAllowed(inputs.slot_time));
        }
        if inputs.instrument_blocked {
            return Err(GateBlock::InstrumentBlocked);
        }
        Ok(())
    }
}
