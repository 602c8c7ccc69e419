use ar_einv_core::EinvResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: String,
    pub event_type: String,
    pub invoice_id: String,
    pub state: String,
    pub request_hash: Option<String>,
    pub assigned_number: Option<String>,
    pub cae: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, invoice_id: &str, state: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            invoice_id: invoice_id.to_string(),
            state: state.to_string(),
            request_hash: None,
            assigned_number: None,
            cae: None,
            errors: Vec::new(),
        }
    }

    pub fn with_hash(mut self, hash: String) -> Self {
        self.request_hash = Some(hash);
        self
    }

    pub fn with_authorization(mut self, assigned_number: String, cae: Option<String>) -> Self {
        self.assigned_number = Some(assigned_number);
        self.cae = cae;
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// Append-only JSON-lines audit trail.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(&self, event: &AuditEvent) -> EinvResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        tracing::debug!(event_type = %event.event_type, invoice_id = %event.invoice_id, "audit event written");
        Ok(())
    }

    /// Audit failures never change an authorization outcome.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(&event) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write audit event");
        }
    }

    pub fn read_all(&self) -> EinvResult<Vec<AuditEvent>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));

        log.record(AuditEvent::new("invoice_submitted", "inv-1", "submitted").with_hash("ab".into()));
        log.record(
            AuditEvent::new("invoice_authorized", "inv-1", "authorized")
                .with_authorization("00001-00000042".into(), Some("12345678901234".into())),
        );

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].request_hash.as_deref(), Some("ab"));
        assert_eq!(events[1].assigned_number.as_deref(), Some("00001-00000042"));
        assert_ne!(events[0].event_id, events[1].event_id);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
