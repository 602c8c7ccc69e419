//! Authorization use case over persisted invoice entities.
//!
//! `Draft -> ValidationFailed | (submitted) -> Authorized | Rejected`.
//! Transient and authority failures leave the entity untouched and are
//! handed back to the caller; nothing here retries a submission on its own.

pub mod audit;
pub mod store;

use access_point::keyed_lock::KeyedLock;
use access_point::BillingService;
use ar_einv_core::models::{AuthorizationResult, AuthorizationStatus, Invoice};
use ar_einv_core::parsing::compute_sha256_hex;
use ar_einv_core::validation::map_and_validate;
use ar_einv_core::{EinvError, EinvResult};
use audit::{AuditEvent, AuditLog};
use chrono::Utc;
use std::sync::Arc;
use store::InvoiceRepository;

pub struct Authorizer {
    billing: Arc<dyn BillingService>,
    invoices: Arc<dyn InvoiceRepository>,
    audit: AuditLog,
    in_flight: KeyedLock<String>,
}

impl Authorizer {
    pub fn new(
        billing: Arc<dyn BillingService>,
        invoices: Arc<dyn InvoiceRepository>,
        audit: AuditLog,
    ) -> Self {
        Self {
            billing,
            invoices,
            audit,
            in_flight: KeyedLock::new(),
        }
    }

    /// Validates, submits and records the outcome for the stored invoice `invoice_id`.
    ///
    /// Returns `Ok` for both approvals and rejections; use
    /// [`AuthorizationResult::ensure_approved`] to treat a rejection as an error.
    pub async fn authorize(&self, invoice_id: &str) -> EinvResult<AuthorizationResult> {
        let _guard = self.in_flight.lock(invoice_id.to_string()).await;

        let invoice = self
            .invoices
            .get(invoice_id)?
            .ok_or_else(|| EinvError::Storage(format!("invoice not found: {invoice_id}")))?;
        if invoice.authorization.status == AuthorizationStatus::Authorized {
            return Err(EinvError::AlreadyAuthorized(invoice_id.to_string()));
        }

        let (request, errors) = map_and_validate(&invoice);
        let request_hash = compute_sha256_hex(&serde_json::to_string(&request)?);

        if !errors.is_empty() {
            tracing::warn!(%invoice_id, errors = errors.len(), "invoice failed validation");
            self.record(invoice_id, |inv| {
                inv.authorization.status = AuthorizationStatus::ValidationFailed;
                inv.authorization.errors = errors.clone();
            })?;
            self.audit.record(
                AuditEvent::new("validation_failed", invoice_id, "validation_failed")
                    .with_hash(request_hash)
                    .with_errors(errors.clone()),
            );
            return Err(EinvError::Validation(errors));
        }

        self.audit.record(
            AuditEvent::new("invoice_submitted", invoice_id, "submitted")
                .with_hash(request_hash.clone()),
        );
        tracing::info!(
            %invoice_id,
            sales_point = request.sales_point,
            voucher_type = request.voucher_type,
            "submitting invoice"
        );

        let result = match self.billing.authorize(&request).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(%invoice_id, error = %err, retriable = err.is_retriable(), "authorization failed");
                self.audit.record(
                    AuditEvent::new("authorization_error", invoice_id, state_name(&invoice))
                        .with_hash(request_hash)
                        .with_errors(vec![err.to_string()]),
                );
                return Err(err);
            }
        };

        if result.is_approved() {
            // Audit first: the voucher exists at the authority whether or not the store update succeeds.
            self.audit.record(
                AuditEvent::new("invoice_authorized", invoice_id, "authorized")
                    .with_hash(request_hash)
                    .with_authorization(result.assigned_number.clone(), result.cae.clone()),
            );
            let recorded = self.record(invoice_id, |inv| {
                let auth = &mut inv.authorization;
                auth.status = AuthorizationStatus::Authorized;
                auth.cae = result.cae.clone();
                auth.cae_expiration = result.cae_expiration;
                auth.assigned_number = Some(result.assigned_number.clone());
                auth.observations = result.observations.clone();
                auth.errors.clear();
            });
            if let Err(err) = recorded {
                tracing::warn!(
                    %invoice_id,
                    number = %result.assigned_number,
                    cae = ?result.cae,
                    error = %err,
                    "authorized invoice could not be persisted"
                );
                return Err(EinvError::UnrecordedAuthorization {
                    invoice_id: invoice_id.to_string(),
                    number: result.assigned_number.clone(),
                    cae: result.cae.clone().unwrap_or_default(),
                    message: err.to_string(),
                });
            }
            tracing::info!(%invoice_id, number = %result.assigned_number, "invoice authorized");
        } else {
            self.record(invoice_id, |inv| {
                let auth = &mut inv.authorization;
                auth.status = AuthorizationStatus::Rejected;
                auth.cae = None;
                auth.cae_expiration = None;
                auth.assigned_number = None;
                auth.observations = result.observations.clone();
                auth.errors = result.errors.clone();
            })?;
            tracing::warn!(%invoice_id, errors = ?result.errors, "invoice rejected");
            self.audit.record(
                AuditEvent::new("invoice_rejected", invoice_id, "rejected")
                    .with_hash(request_hash)
                    .with_errors(result.errors.clone()),
            );
        }
        Ok(result)
    }

    fn record(&self, invoice_id: &str, mut f: impl FnMut(&mut Invoice)) -> EinvResult<Invoice> {
        self.invoices.update(invoice_id, &mut |inv| {
            f(inv);
            inv.authorization.updated_at = Some(Utc::now());
        })
    }
}

fn state_name(invoice: &Invoice) -> &'static str {
    match invoice.authorization.status {
        AuthorizationStatus::Draft => "draft",
        AuthorizationStatus::ValidationFailed => "validation_failed",
        AuthorizationStatus::Rejected => "rejected",
        AuthorizationStatus::Authorized => "authorized",
    }
}
