use super::{
    keyed_lock::KeyedLock,
    signer::{Signer, TicketRequestSigner},
    ticket_cache::TicketStore,
    wsaa_types::{
        is_already_authenticated, login_cms_envelope, parse_login_response,
        parse_ticket_document, LoginResponse,
    },
    SoapTransport, TicketProvider,
};
use ar_einv_core::models::Ticket;
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Tickets are renewed this many seconds before the authority-issued expiration.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 3600;

/// Client for the authentication service (WSAA).
///
/// Hands out cached tickets while they are comfortably valid and otherwise
/// requests a new one with a freshly signed login ticket request. Regeneration
/// is serialized per service so concurrent callers never race the authority
/// into its "already authenticated" fault.
pub struct WsaaClient {
    url: String,
    transport: Arc<dyn SoapTransport>,
    signer: TicketRequestSigner,
    store: Arc<dyn TicketStore>,
    safety_margin: Duration,
    regenerations: KeyedLock<String>,
}

impl WsaaClient {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn SoapTransport>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn TicketStore>,
    ) -> Self {
        Self {
            url: url.into(),
            transport,
            signer: TicketRequestSigner::new(signer),
            store,
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            regenerations: KeyedLock::new(),
        }
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// A ticket for `service` valid beyond the safety margin.
    pub async fn obtain(&self, service: &str) -> EinvResult<Ticket> {
        if let Some(ticket) = self.cached(service).await {
            tracing::debug!(%service, "using cached ticket");
            return Ok(ticket);
        }

        let _guard = self.regenerations.lock(service.to_string()).await;

        // A concurrent caller may have renewed it while we waited.
        if let Some(ticket) = self.cached(service).await {
            tracing::debug!(%service, "ticket renewed by concurrent caller");
            return Ok(ticket);
        }

        match self.request_ticket(service).await {
            Err(EinvError::DuplicateTicket { .. }) => {
                // Another process won the race; its write is our only way to the ticket.
                if let Some(ticket) = self.cached(service).await {
                    tracing::info!(%service, "authority reported an existing ticket; found it in cache");
                    return Ok(ticket);
                }
                Err(EinvError::DuplicateTicket {
                    service: service.to_string(),
                })
            }
            other => other,
        }
    }

    pub async fn invalidate(&self, service: Option<&str>) -> EinvResult<()> {
        self.store.clear(service).await
    }

    async fn cached(&self, service: &str) -> Option<Ticket> {
        self.store
            .read_valid(service, Utc::now(), self.safety_margin)
            .await
    }

    async fn request_ticket(&self, service: &str) -> EinvResult<Ticket> {
        let cms = self.signer.build_and_sign(service).await?;

        tracing::info!(%service, url = %self.url, "requesting access ticket");
        let body = self
            .transport
            .post(&self.url, "", login_cms_envelope(&cms))
            .await?;

        let document = match parse_login_response(&body)? {
            LoginResponse::TicketDocument(document) => document,
            LoginResponse::Fault(fault) if is_already_authenticated(&fault) => {
                tracing::warn!(%service, code = %fault.code, "authority already issued a ticket");
                return Err(EinvError::DuplicateTicket {
                    service: service.to_string(),
                });
            }
            LoginResponse::Fault(fault) => {
                return Err(EinvError::AuthorityFault {
                    code: fault.code,
                    message: fault.message,
                })
            }
        };

        let ticket = parse_ticket_document(&document, service)?;
        self.store.write(service, &ticket).await?;
        tracing::info!(
            %service,
            expiration = %ticket.expiration_time,
            "access ticket issued"
        );
        Ok(ticket)
    }
}

#[async_trait]
impl TicketProvider for WsaaClient {
    async fn ticket(&self, service: &str) -> EinvResult<Ticket> {
        self.obtain(service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FixedSigner, MockAuthority, MockFailure};
    use crate::ticket_cache::MemoryTicketStore;
    use ar_einv_core::models::AUTHORITY_TZ;

    const URL: &str = "https://wsaahomo.example/LoginCms";

    fn client(authority: Arc<MockAuthority>, store: Arc<MemoryTicketStore>) -> WsaaClient {
        WsaaClient::new(URL, authority, Arc::new(FixedSigner::default()), store)
    }

    #[tokio::test]
    async fn requests_once_then_serves_from_cache() {
        let authority = Arc::new(MockAuthority::new());
        let store = Arc::new(MemoryTicketStore::new());
        let wsaa = client(Arc::clone(&authority), Arc::clone(&store));

        let first = wsaa.obtain("wsfe").await.unwrap();
        let second = wsaa.obtain("wsfe").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(authority.call_count("loginCms").await, 1);
        assert_eq!(store.read("wsfe").await, Some(first));
    }

    #[tokio::test]
    async fn near_expiry_ticket_is_regenerated() {
        let authority = Arc::new(MockAuthority::new());
        let store = Arc::new(MemoryTicketStore::new());
        let now = Utc::now().with_timezone(&*AUTHORITY_TZ);
        let stale = Ticket {
            token: "old".into(),
            sign: "old".into(),
            generation_time: now - Duration::hours(11),
            expiration_time: now + Duration::minutes(20),
            service: "wsfe".into(),
            destination: String::new(),
        };
        store.write("wsfe", &stale).await.unwrap();

        let wsaa = client(Arc::clone(&authority), store);
        let fresh = wsaa.obtain("wsfe").await.unwrap();
        assert_ne!(fresh.token, "old");
        assert_eq!(authority.call_count("loginCms").await, 1);
    }

    #[tokio::test]
    async fn duplicate_ticket_fault_is_not_retried() {
        let authority = Arc::new(
            MockAuthority::new().with_failure("loginCms", MockFailure::AlreadyAuthenticated),
        );
        let wsaa = client(Arc::clone(&authority), Arc::new(MemoryTicketStore::new()));

        let err = wsaa.obtain("wsfe").await.unwrap_err();
        assert!(matches!(err, EinvError::DuplicateTicket { ref service } if service == "wsfe"));
        assert!(!err.is_retriable());
        assert_eq!(authority.call_count("loginCms").await, 1);
    }

    #[tokio::test]
    async fn duplicate_fault_recovers_ticket_written_by_another_process() {
        let authority = Arc::new(
            MockAuthority::new()
                .with_latency("loginCms", std::time::Duration::from_millis(50))
                .with_failure("loginCms", MockFailure::AlreadyAuthenticated),
        );
        let store = Arc::new(MemoryTicketStore::new());
        let wsaa = Arc::new(client(Arc::clone(&authority), Arc::clone(&store)));

        let pending = {
            let wsaa = Arc::clone(&wsaa);
            tokio::spawn(async move { wsaa.obtain("wsfe").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // The other process finishes its login while ours is still in flight.
        let now = Utc::now().with_timezone(&*AUTHORITY_TZ);
        let theirs = Ticket {
            token: "other-process".into(),
            sign: "other-sign".into(),
            generation_time: now,
            expiration_time: now + Duration::hours(12),
            service: "wsfe".into(),
            destination: String::new(),
        };
        store.write("wsfe", &theirs).await.unwrap();

        let ticket = pending.await.unwrap().unwrap();
        assert_eq!(ticket.token, "other-process");
        assert_eq!(authority.call_count("loginCms").await, 1);
    }

    #[tokio::test]
    async fn other_faults_surface_code_and_message() {
        let authority = Arc::new(MockAuthority::new().with_failure(
            "loginCms",
            MockFailure::Fault {
                code: "ns1:cms.cert.untrusted".into(),
                message: "Certificado no emitido por AC de confianza".into(),
            },
        ));
        let wsaa = client(authority, Arc::new(MemoryTicketStore::new()));

        match wsaa.obtain("wsfe").await.unwrap_err() {
            EinvError::AuthorityFault { code, message } => {
                assert_eq!(code, "ns1:cms.cert.untrusted");
                assert!(message.contains("confianza"));
            }
            other => panic!("expected authority fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_regeneration() {
        let authority = Arc::new(
            MockAuthority::new().with_latency("loginCms", std::time::Duration::from_millis(30)),
        );
        let wsaa = Arc::new(client(
            Arc::clone(&authority),
            Arc::new(MemoryTicketStore::new()),
        ));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let wsaa = Arc::clone(&wsaa);
                tokio::spawn(async move { wsaa.obtain("wsfe").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(authority.call_count("loginCms").await, 1);
    }

    #[tokio::test]
    async fn network_failure_is_transient() {
        let authority = Arc::new(MockAuthority::new().with_failure("loginCms", MockFailure::Timeout));
        let wsaa = client(authority, Arc::new(MemoryTicketStore::new()));
        assert!(wsaa.obtain("wsfe").await.unwrap_err().is_retriable());
    }
}
