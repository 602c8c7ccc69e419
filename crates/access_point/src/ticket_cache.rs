//! Ticket cache store.
//!
//! One ticket per service name. Reads are fail-open: a missing or unreadable
//! record is a cache miss that forces regeneration, never an error that blocks
//! invoice issuance.

use ar_einv_core::models::Ticket;
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn read(&self, service: &str) -> Option<Ticket>;

    async fn write(&self, service: &str, ticket: &Ticket) -> EinvResult<()>;

    /// Removes the entry for `service`, or every entry when `None`.
    async fn clear(&self, service: Option<&str>) -> EinvResult<()>;

    /// The cached ticket, provided it outlives `now` by more than `margin`.
    async fn read_valid(
        &self,
        service: &str,
        now: DateTime<Utc>,
        margin: Duration,
    ) -> Option<Ticket> {
        let ticket = self.read(service).await?;
        if ticket.is_usable_at(now, margin) {
            Some(ticket)
        } else {
            tracing::debug!(
                %service,
                expiration = %ticket.expiration_time,
                "cached ticket inside safety margin"
            );
            None
        }
    }
}

/// Directory-backed store, one `<service>.json` file per service.
#[derive(Debug, Clone)]
pub struct FileTicketStore {
    dir: PathBuf,
}

impl FileTicketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        let name: String = service
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

/// Writes via a temp file in the same directory so readers never see a partial record.
fn write_atomic(path: &Path, content: &[u8]) -> EinvResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(content)?;
    temp_file
        .persist(path)
        .map_err(|e| EinvError::Storage(format!("failed to persist {}: {e}", path.display())))?;
    Ok(())
}

#[async_trait]
impl TicketStore for FileTicketStore {
    async fn read(&self, service: &str) -> Option<Ticket> {
        let path = self.path_for(service);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%service, "no cached ticket");
                return None;
            }
            Err(e) => {
                tracing::warn!(%service, path = %path.display(), error = %e, "unreadable ticket cache");
                return None;
            }
        };
        match serde_json::from_slice::<Ticket>(&bytes) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                tracing::warn!(%service, path = %path.display(), error = %e, "corrupt ticket cache, ignoring");
                None
            }
        }
    }

    async fn write(&self, service: &str, ticket: &Ticket) -> EinvResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(ticket)?;
        let path = self.path_for(service);
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| EinvError::Storage(format!("ticket write task failed: {e}")))??;
        tracing::debug!(%service, expiration = %ticket.expiration_time, "ticket cached");
        Ok(())
    }

    async fn clear(&self, service: Option<&str>) -> EinvResult<()> {
        match service {
            Some(service) => match tokio::fs::remove_file(self.path_for(service)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            None => {
                let mut entries = match tokio::fs::read_dir(&self.dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        tokio::fs::remove_file(&path).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// In-process store for tests and single-run tooling.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    tickets: Mutex<HashMap<String, Ticket>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn read(&self, service: &str) -> Option<Ticket> {
        self.tickets.lock().await.get(service).cloned()
    }

    async fn write(&self, service: &str, ticket: &Ticket) -> EinvResult<()> {
        self.tickets
            .lock()
            .await
            .insert(service.to_string(), ticket.clone());
        Ok(())
    }

    async fn clear(&self, service: Option<&str>) -> EinvResult<()> {
        let mut tickets = self.tickets.lock().await;
        match service {
            Some(service) => {
                tickets.remove(service);
            }
            None => tickets.clear(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_einv_core::models::AUTHORITY_TZ;
    use std::sync::Arc;

    fn ticket(service: &str, valid_for: Duration) -> Ticket {
        let now = Utc::now().with_timezone(&*AUTHORITY_TZ);
        Ticket {
            token: "PD94bWwgdmVyc2lvbj0i".into(),
            sign: "c2lnbmF0dXJl".into(),
            generation_time: now,
            expiration_time: now + valid_for,
            service: service.into(),
            destination: "SERIALNUMBER=CUIT 30712345678, CN=test".into(),
        }
    }

    #[tokio::test]
    async fn round_trips_before_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTicketStore::new(dir.path().join("tickets"));
        let written = ticket("wsfe", Duration::hours(12));
        store.write("wsfe", &written).await.unwrap();

        let read = store
            .read_valid("wsfe", Utc::now(), Duration::hours(1))
            .await;
        assert_eq!(read, Some(written));
    }

    #[tokio::test]
    async fn ticket_inside_margin_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTicketStore::new(dir.path());
        store
            .write("wsfe", &ticket("wsfe", Duration::minutes(30)))
            .await
            .unwrap();

        assert!(store.read("wsfe").await.is_some());
        assert!(store
            .read_valid("wsfe", Utc::now(), Duration::hours(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTicketStore::new(dir.path());
        std::fs::write(store.path_for("wsfe"), b"{\"token\": \"trunc").unwrap();
        assert!(store.read("wsfe").await.is_none());
        assert!(store.read("missing").await.is_none());
    }

    #[tokio::test]
    async fn write_supersedes_and_clear_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTicketStore::new(dir.path());
        store
            .write("wsfe", &ticket("wsfe", Duration::hours(1)))
            .await
            .unwrap();
        let newer = ticket("wsfe", Duration::hours(12));
        store.write("wsfe", &newer).await.unwrap();
        store
            .write("ws_sr_padron_a5", &ticket("ws_sr_padron_a5", Duration::hours(12)))
            .await
            .unwrap();
        assert_eq!(store.read("wsfe").await, Some(newer));

        store.clear(Some("wsfe")).await.unwrap();
        assert!(store.read("wsfe").await.is_none());
        assert!(store.read("ws_sr_padron_a5").await.is_some());

        store.clear(None).await.unwrap();
        assert!(store.read("ws_sr_padron_a5").await.is_none());
        store.clear(Some("wsfe")).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writes_leave_one_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTicketStore::new(dir.path()));

        let handles: Vec<_> = (1..=6)
            .map(|hours| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .write("wsfe", &ticket("wsfe", Duration::hours(hours)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(store.read("wsfe").await.is_some());
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("wsfe.json")]);
    }

    #[test]
    fn service_names_are_sanitized() {
        let store = FileTicketStore::new("/tmp/t");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/t/___etc_passwd.json")
        );
    }

    #[tokio::test]
    async fn memory_store_behaves_like_file_store() {
        let store = MemoryTicketStore::new();
        let t = ticket("wsfe", Duration::hours(12));
        store.write("wsfe", &t).await.unwrap();
        assert_eq!(store.read("wsfe").await, Some(t));
        store.clear(None).await.unwrap();
        assert!(store.read("wsfe").await.is_none());
    }
}
