use crate::audit::{AuditEvent, AuditSink};
use anyhow::Context;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends one JSON object per line. Monitoring tools tail this file.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&event).context("serialize audit event")?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .with_context(|| format!("append audit log {}", self.path.display()))?;
        file.flush().context("flush audit log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Incident, IncidentKind};
    use chrono::{TimeZone, Utc};

    #[test]
    fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::open(dir.path().join("audit/events.jsonl")).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 14, 0, 0).unwrap();
        for _ in 0..2 {
            sink.emit(AuditEvent::Incident(Incident::new(ts, IncidentKind::OrphanFill, "x")))
                .unwrap();
        }
        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(parsed, AuditEvent::Incident(i) if i.kind == IncidentKind::OrphanFill));
    }
}
