use access_point::mock::{FixedSigner, MockAuthority, MockFailure};
use access_point::ticket_cache::MemoryTicketStore;
use access_point::wsaa::WsaaClient;
use access_point::wsfe::WsfeClient;
use access_point::BillingService;
use ar_einv_core::codes::{Concept, DocumentType, TaxCondition, VoucherType};
use ar_einv_core::models::{
    AuthorizationRecord, AuthorizationResult, AuthorizationStatus, CaeRequest, Customer, Invoice,
    Issuer, LineItem, Outcome, Totals,
};
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use authorizer::audit::AuditLog;
use authorizer::store::{InvoiceRepository, SledInvoiceStore};
use authorizer::Authorizer;
use chrono::NaiveDate;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    authorizer: Authorizer,
    store: Arc<SledInvoiceStore>,
    audit: AuditLog,
    _dir: TempDir,
}

fn harness(billing: Arc<dyn BillingService>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = Arc::new(SledInvoiceStore::with_db(&db).unwrap());
    let audit = AuditLog::new(dir.path().join("audit.jsonl"));
    Harness {
        authorizer: Authorizer::new(billing, store.clone(), audit.clone()),
        store,
        audit,
        _dir: dir,
    }
}

fn wsfe(authority: &Arc<MockAuthority>) -> Arc<WsfeClient> {
    let wsaa = WsaaClient::new(
        "mock://wsaa",
        Arc::clone(authority) as _,
        Arc::new(FixedSigner::default()),
        Arc::new(MemoryTicketStore::new()),
    );
    Arc::new(WsfeClient::new(
        "mock://wsfe",
        "30712345678",
        Arc::clone(authority) as _,
        Arc::new(wsaa),
    ))
}

fn invoice_b(id: &str) -> Invoice {
    Invoice {
        id: id.into(),
        issuer: Issuer {
            name: "Ferreteria Sur SRL".into(),
            cuit: "30712345678".into(),
            tax_condition: TaxCondition::Registered,
        },
        customer: Customer {
            name: "Consumidor".into(),
            document_type: DocumentType::Dni,
            document_number: "28123456".into(),
            tax_condition: TaxCondition::FinalConsumer,
        },
        sales_point: 1,
        voucher_type: VoucherType::InvoiceB,
        concept: Concept::Goods,
        issue_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
        service_period: None,
        lines: vec![LineItem {
            description: "Taladro".into(),
            quantity: 1.0,
            unit_price: 100.0,
            vat_rate: Some(21.0),
        }],
        totals: Totals {
            net: 100.0,
            vat: 21.0,
            grand_total: 121.0,
            ..Totals::default()
        },
        associated: None,
        currency: "PES".into(),
        exchange_rate: 1.0,
        authorization: AuthorizationRecord::default(),
    }
}

/// Reads from sled but refuses every update.
struct ReadOnlyStore(SledInvoiceStore);

impl InvoiceRepository for ReadOnlyStore {
    fn get(&self, id: &str) -> EinvResult<Option<Invoice>> {
        self.0.get(id)
    }

    fn put(&self, invoice: &Invoice) -> EinvResult<()> {
        self.0.put(invoice)
    }

    fn update(&self, _id: &str, _f: &mut dyn FnMut(&mut Invoice)) -> EinvResult<Invoice> {
        Err(EinvError::Storage("disk full".into()))
    }

    fn list(&self) -> EinvResult<Vec<Invoice>> {
        self.0.list()
    }
}

/// Rejects every submission with a fixed reason.
struct RejectingBilling;

#[async_trait]
impl BillingService for RejectingBilling {
    async fn last_authorized(&self, _sales_point: u32, _voucher_type: u32) -> EinvResult<u64> {
        Ok(7)
    }

    async fn authorize(&self, request: &CaeRequest) -> EinvResult<AuthorizationResult> {
        Ok(AuthorizationResult {
            outcome: Outcome::Rejected,
            cae: None,
            cae_expiration: None,
            sales_point: request.sales_point,
            number: 8,
            assigned_number: "00001-00000008".into(),
            observations: Vec::new(),
            errors: vec!["10015: Documento del receptor invalido".into()],
        })
    }
}

#[tokio::test]
async fn approved_invoice_records_cae_and_number() {
    let authority = Arc::new(
        MockAuthority::new()
            .with_last_voucher(1, 6, 41)
            .with_cae("12345678901234"),
    );
    let h = harness(wsfe(&authority));
    h.store.put(&invoice_b("inv-1")).unwrap();

    let result = h.authorizer.authorize("inv-1").await.unwrap();
    assert_eq!(result.assigned_number, "00001-00000042");

    let stored = h.store.get("inv-1").unwrap().unwrap();
    let auth = &stored.authorization;
    assert_eq!(auth.status, AuthorizationStatus::Authorized);
    assert_eq!(auth.cae.as_deref(), Some("12345678901234"));
    assert_eq!(auth.cae_expiration, NaiveDate::from_ymd_opt(2024, 5, 20));
    assert_eq!(auth.assigned_number.as_deref(), Some("00001-00000042"));
    assert!(auth.updated_at.is_some());

    let events: Vec<_> = h
        .audit
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(events, vec!["invoice_submitted", "invoice_authorized"]);
}

#[tokio::test]
async fn invalid_invoice_never_reaches_the_authority() {
    let authority = Arc::new(MockAuthority::new());
    let h = harness(wsfe(&authority));
    let mut invoice = invoice_b("inv-2");
    invoice.concept = Concept::Services;
    h.store.put(&invoice).unwrap();

    let err = h.authorizer.authorize("inv-2").await.unwrap_err();
    match err {
        EinvError::Validation(errors) => {
            assert!(errors.iter().any(|e| e.contains("Service dates")))
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(authority.call_count("FECompUltimoAutorizado").await, 0);
    assert_eq!(authority.call_count("FECAESolicitar").await, 0);
    assert_eq!(authority.call_count("loginCms").await, 0);

    let stored = h.store.get("inv-2").unwrap().unwrap();
    assert_eq!(stored.authorization.status, AuthorizationStatus::ValidationFailed);
    assert!(!stored.authorization.errors.is_empty());
    assert_eq!(h.audit.read_all().unwrap()[0].event_type, "validation_failed");
}

#[tokio::test]
async fn timeout_leaves_the_invoice_unchanged() {
    let authority = Arc::new(
        MockAuthority::new()
            .with_last_voucher(1, 6, 41)
            .with_failure("FECAESolicitar", MockFailure::Timeout),
    );
    let h = harness(wsfe(&authority));
    h.store.put(&invoice_b("inv-3")).unwrap();

    let err = h.authorizer.authorize("inv-3").await.unwrap_err();
    assert!(err.is_retriable());
    assert!(err.outcome_unknown());

    let stored = h.store.get("inv-3").unwrap().unwrap();
    assert_eq!(stored.authorization.status, AuthorizationStatus::Draft);
    assert!(stored.authorization.cae.is_none());
    assert!(stored.authorization.updated_at.is_none());

    let last = h.audit.read_all().unwrap().pop().unwrap();
    assert_eq!(last.event_type, "authorization_error");
    assert_eq!(last.state, "draft");

    // Operator-driven retry once the authority answers again.
    authority.set_failure("FECAESolicitar", None).await;
    let result = h.authorizer.authorize("inv-3").await.unwrap();
    assert_eq!(result.number, 42);
}

#[tokio::test]
async fn rejection_is_persisted_for_correction() {
    let h = harness(Arc::new(RejectingBilling));
    h.store.put(&invoice_b("inv-4")).unwrap();

    let result = h.authorizer.authorize("inv-4").await.unwrap();
    assert_eq!(result.outcome, Outcome::Rejected);
    assert!(matches!(
        result.clone().ensure_approved(),
        Err(EinvError::Rejection { .. })
    ));

    let stored = h.store.get("inv-4").unwrap().unwrap();
    assert_eq!(stored.authorization.status, AuthorizationStatus::Rejected);
    assert_eq!(stored.authorization.errors, result.errors);
    assert!(stored.authorization.assigned_number.is_none());
    assert_eq!(h.audit.read_all().unwrap()[1].event_type, "invoice_rejected");
}

#[tokio::test]
async fn authorized_invoice_is_not_resubmitted() {
    let authority = Arc::new(MockAuthority::new());
    let h = harness(wsfe(&authority));
    h.store.put(&invoice_b("inv-5")).unwrap();

    h.authorizer.authorize("inv-5").await.unwrap();
    let err = h.authorizer.authorize("inv-5").await.unwrap_err();
    assert!(matches!(err, EinvError::AlreadyAuthorized(ref id) if id == "inv-5"));
    assert_eq!(authority.call_count("FECAESolicitar").await, 1);
}

#[tokio::test]
async fn concurrent_invoices_receive_distinct_numbers() {
    let authority = Arc::new(
        MockAuthority::new()
            .with_last_voucher(1, 6, 9)
            .with_latency("FECompUltimoAutorizado", std::time::Duration::from_millis(10)),
    );
    let h = Arc::new(harness(wsfe(&authority)));
    for id in ["a", "b", "c"] {
        h.store.put(&invoice_b(id)).unwrap();
    }

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|id| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.authorizer.authorize(id).await })
        })
        .collect();
    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().number);
    }
    numbers.sort_unstable();
    assert_eq!(numbers, vec![10, 11, 12]);
}

#[tokio::test]
async fn unknown_invoice_is_a_storage_error() {
    let h = harness(Arc::new(RejectingBilling));
    assert!(matches!(
        h.authorizer.authorize("ghost").await,
        Err(EinvError::Storage(_))
    ));
}

#[tokio::test]
async fn approval_survives_a_failed_store_update() {
    let authority = Arc::new(
        MockAuthority::new()
            .with_last_voucher(1, 6, 41)
            .with_cae("12345678901234"),
    );
    let dir = tempfile::tempdir().unwrap();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = Arc::new(ReadOnlyStore(SledInvoiceStore::with_db(&db).unwrap()));
    store.put(&invoice_b("inv-6")).unwrap();
    let audit = AuditLog::new(dir.path().join("audit.jsonl"));
    let authorizer = Authorizer::new(wsfe(&authority), store, audit.clone());

    let err = authorizer.authorize("inv-6").await.unwrap_err();
    match &err {
        EinvError::UnrecordedAuthorization { number, cae, .. } => {
            assert_eq!(number, "00001-00000042");
            assert_eq!(cae, "12345678901234");
        }
        other => panic!("expected unrecorded authorization, got {other:?}"),
    }
    assert!(!err.is_retriable());
    assert_eq!(authority.last_voucher(1, 6).await, 42);

    let authorized = audit
        .read_all()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "invoice_authorized")
        .unwrap();
    assert_eq!(authorized.cae.as_deref(), Some("12345678901234"));
    assert_eq!(authorized.assigned_number.as_deref(), Some("00001-00000042"));
}
