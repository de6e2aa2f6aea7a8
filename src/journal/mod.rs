//! Durable journals.
//!
//! Layout under the journal root:
//! - `streams/<date>_<stream>.json` holds the [`StreamJournal`] recovery record.
//! - `executions/<date>_<stream>_<intent>.json` holds one [`ExecutionJournalEntry`].
//!
//! Records are written whole through a temp file and rename, so a reader sees
//! either the previous or the next version. A file that exists but does not
//! parse is corruption and is reported as such, never as "absent".

pub mod execution;
pub mod stream;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::JournalError;
use crate::types::{IntentId, StreamKey};

pub use execution::{ExecutionJournalEntry, FillEffect, LegFills, RealizedPnl};
pub use stream::StreamJournal;

#[derive(Clone, Debug)]
pub struct JournalStore {
    root: PathBuf,
}

impl JournalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let root = root.into();
        for dir in [root.join("streams"), root.join("executions")] {
            fs::create_dir_all(&dir).map_err(|source| JournalError::Io { path: dir.clone(), source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stream_path(&self, key: &StreamKey) -> PathBuf {
        self.root.join("streams").join(format!("{key}.json"))
    }

    pub fn execution_path(&self, key: &StreamKey, intent_id: &IntentId) -> PathBuf {
        self.root
            .join("executions")
            .join(format!("{key}_{intent_id}.json"))
    }

    pub fn load_stream(&self, key: &StreamKey) -> Result<Option<StreamJournal>, JournalError> {
        read_record(&self.stream_path(key))
    }

    pub fn save_stream(&self, journal: &StreamJournal) -> Result<(), JournalError> {
        let key = StreamKey {
            trading_date: journal.trading_date,
            stream_id: journal.stream_id.clone(),
        };
        write_record(&self.stream_path(&key), journal)
    }

    pub fn load_execution(
        &self,
        key: &StreamKey,
        intent_id: &IntentId,
    ) -> Result<Option<ExecutionJournalEntry>, JournalError> {
        read_record(&self.execution_path(key, intent_id))
    }

    pub fn save_execution(&self, key: &StreamKey, entry: &ExecutionJournalEntry) -> Result<(), JournalError> {
        write_record(&self.execution_path(key, &entry.intent_id), entry)
    }

    /// Every execution entry recorded for one stream occurrence, oldest submission first.
    pub fn executions_for_stream(&self, key: &StreamKey) -> Result<Vec<ExecutionJournalEntry>, JournalError> {
        let dir = self.root.join("executions");
        let prefix = format!("{key}_");
        let listing = fs::read_dir(&dir).map_err(|source| JournalError::Io { path: dir.clone(), source })?;
        let mut out = Vec::new();
        for item in listing {
            let item = item.map_err(|source| JournalError::Io { path: dir.clone(), source })?;
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else { continue };
            // Stream ids may share a prefix; the remainder must be exactly `<intent>.json`.
            let Some(intent) = rest.strip_suffix(".json") else { continue };
            if intent.contains('_') {
                continue;
            }
            if let Some(entry) = read_record::<ExecutionJournalEntry>(&item.path())? {
                out.push(entry);
            }
        }
        out.sort_by(|a, b| {
            a.entry_submitted_at
                .cmp(&b.entry_submitted_at)
                .then_with(|| a.intent_id.cmp(&b.intent_id))
        });
        Ok(out)
    }

    /// The intent already sent for this stream occurrence, if any.
    pub fn submitted_entry(&self, key: &StreamKey) -> Result<Option<ExecutionJournalEntry>, JournalError> {
        Ok(self
            .executions_for_stream(key)?
            .into_iter()
            .find(|e| e.entry_submitted))
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JournalError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(JournalError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| JournalError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), JournalError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| JournalError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(|source| JournalError::Io { path: tmp.clone(), source })?;
    fs::rename(&tmp, path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "journal written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::fixtures::long_intent;
    use crate::types::StreamId;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn key(id: &str) -> StreamKey {
        StreamKey {
            trading_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            stream_id: StreamId(id.into()),
        }
    }

    #[test]
    fn missing_records_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        assert!(store.load_stream(&key("ES1")).unwrap().is_none());
        assert!(store.submitted_entry(&key("ES1")).unwrap().is_none());
    }

    #[test]
    fn corrupt_records_are_errors_not_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        fs::write(store.stream_path(&key("ES1")), b"{not json").unwrap();
        assert!(matches!(
            store.load_stream(&key("ES1")),
            Err(JournalError::Corrupt { .. })
        ));
    }

    #[test]
    fn executions_are_scoped_to_their_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 14, 0, 0).unwrap();

        let mut a = ExecutionJournalEntry::new(long_intent(), 1.0);
        a.mark_submitted(now);
        store.save_execution(&key("ES1"), &a).unwrap();

        let mut other = long_intent();
        other.stream_id = StreamId("ES10".into());
        let b = ExecutionJournalEntry::new(other, 1.0);
        store.save_execution(&key("ES10"), &b).unwrap();

        let es1 = store.executions_for_stream(&key("ES1")).unwrap();
        assert_eq!(es1.len(), 1);
        assert_eq!(es1[0].intent_id, a.intent_id);
        assert_eq!(store.submitted_entry(&key("ES1")).unwrap().map(|e| e.intent_id), Some(a.intent_id));
        assert!(store.submitted_entry(&key("ES10")).unwrap().is_none());
    }

    #[test]
    fn stream_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 14, 0, 0).unwrap();
        let mut j = StreamJournal::new(key("ES1").trading_date, StreamId("ES1".into()), now);
        j.entry_detected = true;
        store.save_stream(&j).unwrap();
        assert_eq!(store.load_stream(&key("ES1")).unwrap(), Some(j));
    }
}
