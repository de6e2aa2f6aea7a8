//! Static per-instrument and per-session configuration.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ConfigError, SetupError};
use crate::types::Instrument;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub name: String,
    /// Local time the range window opens.
    pub range_start: NaiveTime,
    /// Local time after which no entry is taken and the stream concludes.
    pub market_close: NaiveTime,
    /// Slot times a timetable may schedule for this session.
    pub allowed_slots: Vec<NaiveTime>,
}

impl SessionSpec {
    pub fn allows_slot(&self, slot: NaiveTime) -> bool {
        self.allowed_slots.contains(&slot)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Canonical symbol streams are keyed on (e.g. `ES`).
    pub canonical: Instrument,
    /// Symbols that route to this canonical instrument (e.g. `MES`).
    #[serde(default)]
    pub aliases: Vec<Instrument>,
    pub tick_size: f64,
    /// Currency per point per contract.
    pub contract_multiplier: f64,
    /// Target distance in points from entry.
    pub target_points: f64,
    /// Optional cap on stop distance in points.
    #[serde(default)]
    pub stop_cap_points: Option<f64>,
    pub base_quantity: f64,
    pub sessions: Vec<SessionSpec>,
}

impl InstrumentSpec {
    pub fn session(&self, name: &str) -> Option<&SessionSpec> {
        self.sessions.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bad = |reason: &str| ConfigError::InvalidInstrument {
            instrument: self.canonical.clone(),
            reason: reason.to_string(),
        };
        if !(self.tick_size.is_finite() && self.tick_size > 0.0) {
            return Err(bad("tick_size must be > 0"));
        }
        if !(self.contract_multiplier.is_finite() && self.contract_multiplier > 0.0) {
            return Err(bad("contract_multiplier must be > 0"));
        }
        if !(self.target_points.is_finite() && self.target_points > 0.0) {
            return Err(bad("target_points must be > 0"));
        }
        if !(self.base_quantity.is_finite() && self.base_quantity > 0.0) {
            return Err(bad("base_quantity must be > 0"));
        }
        if let Some(cap) = self.stop_cap_points {
            if !(cap.is_finite() && cap > 0.0) {
                return Err(bad("stop_cap_points must be > 0"));
            }
        }
        for s in &self.sessions {
            if s.range_start >= s.market_close {
                return Err(bad(&format!("session {} opens after it closes", s.name)));
            }
        }
        Ok(())
    }
}

/// Lookup of instrument specs by canonical symbol or alias.
#[derive(Clone, Debug, Default)]
pub struct InstrumentRegistry {
    specs: BTreeMap<Instrument, InstrumentSpec>,
    canonical_by_symbol: BTreeMap<Instrument, Instrument>,
}

impl InstrumentRegistry {
    pub fn new(specs: Vec<InstrumentSpec>) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for spec in specs {
            spec.validate()?;
            if registry.specs.contains_key(&spec.canonical) {
                return Err(ConfigError::DuplicateInstrument(spec.canonical));
            }
            registry
                .canonical_by_symbol
                .insert(spec.canonical.clone(), spec.canonical.clone());
            for alias in &spec.aliases {
                registry
                    .canonical_by_symbol
                    .insert(alias.clone(), spec.canonical.clone());
            }
            registry.specs.insert(spec.canonical.clone(), spec);
        }
        Ok(registry)
    }

    /// Canonical instrument for a traded or quoted symbol.
    pub fn canonical_for(&self, symbol: &Instrument) -> Option<&Instrument> {
        self.canonical_by_symbol.get(symbol)
    }

    /// Resolve a (symbol, session, slot) triple, checking the slot is schedulable.
    pub fn resolve(
        &self,
        symbol: &Instrument,
        session: &str,
        slot: NaiveTime,
    ) -> Result<(&InstrumentSpec, &SessionSpec), SetupError> {
        let canonical = self
            .canonical_for(symbol)
            .ok_or_else(|| SetupError::UnknownInstrument(symbol.clone()))?;
        let spec = self
            .specs
            .get(canonical)
            .ok_or_else(|| SetupError::UnknownInstrument(symbol.clone()))?;
        let sess = spec.session(session).ok_or_else(|| SetupError::UnknownSession {
            instrument: symbol.clone(),
            session: session.to_string(),
        })?;
        if !sess.allows_slot(slot) {
            return Err(SetupError::SlotNotAllowed {
                session: session.to_string(),
                slot,
            });
        }
        if slot <= sess.range_start || slot >= sess.market_close {
            return Err(SetupError::SlotOutsideSession {
                session: session.to_string(),
                slot,
            });
        }
        Ok((spec, sess))
    }
}
