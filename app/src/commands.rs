use crate::Clients;
use anyhow::Context;
use ar_einv_core::codes::VoucherType;
use ar_einv_core::models::{AuthorizationStatus, Invoice};
use ar_einv_core::EinvError;
use authorizer::audit::AuditLog;
use authorizer::store::{InvoiceRepository, SledInvoiceStore};
use authorizer::Authorizer;
use config::AppConfig;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use walkdir::WalkDir;

/// Exit status for an invoice the authority rejected.
const REJECTED_EXIT: u8 = 2;

fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<SledInvoiceStore>> {
    let store = SledInvoiceStore::open(&cfg.store.path)
        .with_context(|| format!("Failed to open invoice store at {}", cfg.store.path.display()))?;
    Ok(Arc::new(store))
}

pub async fn dummy(clients: &Clients) -> anyhow::Result<Value> {
    let status = clients.wsfe.dummy().await?;
    Ok(json!({ "healthy": status.is_healthy(), "status": status }))
}

pub async fn points_of_sale(clients: &Clients) -> anyhow::Result<Value> {
    let points = clients.wsfe.points_of_sale().await?;
    Ok(serde_json::to_value(points)?)
}

fn known_voucher_type(code: u32) -> anyhow::Result<VoucherType> {
    VoucherType::from_code(code)
        .ok_or_else(|| anyhow::anyhow!("unsupported voucher type code {code}"))
}

pub async fn last_voucher(clients: &Clients, point: u32, voucher_type: u32) -> anyhow::Result<Value> {
    let kind = known_voucher_type(voucher_type)?;
    let last = clients.wsfe.last_authorized(point, kind.code()).await?;
    Ok(json!({
        "sales_point": point,
        "voucher_type": kind,
        "last_authorized": last,
        "next": last + 1,
    }))
}

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub imported: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Serialize)]
pub struct ImportFailure {
    pub path: String,
    pub error: String,
}

pub fn import(cfg: &AppConfig, dir: &Path) -> anyhow::Result<Value> {
    let store = open_store(cfg)?;
    Ok(serde_json::to_value(import_dir(store.as_ref(), dir)?)?)
}

/// Stores every `*.json` invoice under `dir` as a draft. Authorized invoices are never overwritten.
pub fn import_dir(store: &dyn InvoiceRepository, dir: &Path) -> anyhow::Result<ImportSummary> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let mut summary = ImportSummary::default();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        let is_json = entry.file_type().is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if !is_json {
            continue;
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<Invoice>(&raw).map_err(anyhow::Error::from));
        let mut invoice = match parsed {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable invoice");
                summary.failed.push(ImportFailure {
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        if let Some(existing) = store.get(&invoice.id)? {
            if existing.authorization.status == AuthorizationStatus::Authorized {
                summary.skipped.push(invoice.id);
                continue;
            }
        }
        invoice.authorization = Default::default();
        store.put(&invoice)?;
        tracing::info!(invoice_id = %invoice.id, path = %path.display(), "Imported invoice");
        summary.imported.push(invoice.id);
    }
    Ok(summary)
}

pub async fn authorize(
    cfg: &AppConfig,
    clients: &Clients,
    invoice_id: &str,
) -> anyhow::Result<(Value, ExitCode)> {
    let store = open_store(cfg)?;
    let authorizer = Authorizer::new(
        clients.wsfe.clone(),
        store,
        AuditLog::new(cfg.audit.path.clone()),
    );

    let result = authorizer.authorize(invoice_id).await?;
    if result.is_approved() {
        Ok((
            json!({
                "outcome": "approved",
                "invoice_id": invoice_id,
                "assigned_number": result.assigned_number,
                "cae": result.cae,
                "cae_expiration": result.cae_expiration,
                "observations": result.observations,
            }),
            ExitCode::SUCCESS,
        ))
    } else {
        Ok((
            json!({
                "outcome": "rejected",
                "invoice_id": invoice_id,
                "attempted_number": result.assigned_number,
                "errors": result.errors,
                "observations": result.observations,
            }),
            ExitCode::from(REJECTED_EXIT),
        ))
    }
}

pub fn show(cfg: &AppConfig, invoice_id: &str) -> anyhow::Result<Value> {
    let store = open_store(cfg)?;
    let invoice = store
        .get(invoice_id)?
        .ok_or_else(|| anyhow::anyhow!("invoice not found: {invoice_id}"))?;
    Ok(serde_json::to_value(invoice)?)
}

pub fn list(cfg: &AppConfig) -> anyhow::Result<Value> {
    let store = open_store(cfg)?;
    Ok(Value::Array(list_rows(store.as_ref())?))
}

/// One summary row per stored invoice, ordered by id.
pub fn list_rows(store: &dyn InvoiceRepository) -> anyhow::Result<Vec<Value>> {
    let mut invoices = store.list()?;
    invoices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(invoices
        .into_iter()
        .map(|inv| {
            json!({
                "id": inv.id,
                "sales_point": inv.sales_point,
                "voucher_type": inv.voucher_type,
                "grand_total": inv.totals.grand_total,
                "status": inv.authorization.status,
                "assigned_number": inv.authorization.assigned_number,
                "cae": inv.authorization.cae,
            })
        })
        .collect())
}

pub fn init_config(cfg: &AppConfig) -> anyhow::Result<Value> {
    config::store(cfg)?;
    let path = config::config_path()?;
    Ok(json!({ "written": path.display().to_string() }))
}

pub async fn clear_tickets(clients: &Clients, service: Option<&str>) -> anyhow::Result<Value> {
    clients.wsaa.invalidate(service).await?;
    Ok(json!({ "cleared": service.unwrap_or("all") }))
}

pub fn store_credentials(cert: &Path, key: &Path) -> anyhow::Result<Value> {
    let certificate_pem = std::fs::read_to_string(cert)
        .with_context(|| format!("Failed to read {}", cert.display()))?;
    let private_key_pem = std::fs::read_to_string(key)
        .with_context(|| format!("Failed to read {}", key.display()))?;
    config::credentials::store_in_keychain(&certificate_pem, &private_key_pem)?;
    Ok(json!({ "stored": true }))
}

pub fn forget_credentials() -> anyhow::Result<Value> {
    config::credentials::remove_from_keychain();
    Ok(json!({ "removed": true }))
}

/// Infrastructure and configuration failures, kept apart from business rejections.
pub fn error_json(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<EinvError>() {
        Some(einv) => {
            let kind = match einv {
                EinvError::Configuration(_) => "configuration",
                EinvError::Signing(_) => "signing",
                EinvError::TransientNetwork { .. } => "transient_network",
                EinvError::AuthorityFault { .. } => "authority_fault",
                EinvError::DuplicateTicket { .. } => "duplicate_ticket",
                EinvError::Validation(_) => "validation",
                EinvError::Rejection { .. } => "rejection",
                EinvError::MalformedResponse(_) => "malformed_response",
                EinvError::Storage(_) => "storage",
                EinvError::AlreadyAuthorized(_) => "already_authorized",
                EinvError::UnrecordedAuthorization { .. } => "unrecorded_authorization",
            };
            let mut out = json!({
                "outcome": "error",
                "kind": kind,
                "message": einv.to_string(),
                "retriable": einv.is_retriable(),
                "outcome_unknown": einv.outcome_unknown(),
            });
            match einv {
                EinvError::Validation(errors) => out["errors"] = json!(errors),
                EinvError::UnrecordedAuthorization { number, cae, .. } => {
                    out["assigned_number"] = json!(number);
                    out["cae"] = json!(cae);
                }
                _ => {}
            }
            out
        }
        None => json!({ "outcome": "error", "kind": "other", "message": format!("{err:#}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE: &str = r#"{
        "id": "inv-100",
        "issuer": { "name": "Acme SA", "cuit": "30712345678", "tax_condition": "registered" },
        "customer": { "name": "Juan Perez", "document_type": "dni", "document_number": "30111222", "tax_condition": "final_consumer" },
        "sales_point": 1,
        "voucher_type": "invoice_b",
        "concept": "goods",
        "issue_date": "2024-05-10",
        "lines": [{ "description": "Widget", "quantity": 2.0, "unit_price": 50.0, "vat_rate": 21.0 }],
        "totals": { "net": 100.0, "vat": 21.0, "grand_total": 121.0 }
    }"#;

    fn temp_store() -> SledInvoiceStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledInvoiceStore::with_db(&db).unwrap()
    }

    #[test]
    fn import_walks_nested_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("may")).unwrap();
        std::fs::write(dir.path().join("may/inv-100.json"), INVOICE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let store = temp_store();
        let summary = import_dir(&store, dir.path()).unwrap();
        assert_eq!(summary.imported, vec!["inv-100"]);
        assert_eq!(summary.failed.len(), 1);
        assert!(store.get("inv-100").unwrap().is_some());
    }

    #[test]
    fn import_keeps_authorized_invoices() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inv.json"), INVOICE).unwrap();
        let store = temp_store();
        import_dir(&store, dir.path()).unwrap();
        store
            .update("inv-100", &mut |inv| {
                inv.authorization.status = AuthorizationStatus::Authorized;
                inv.authorization.cae = Some("12345678901234".into());
            })
            .unwrap();

        let summary = import_dir(&store, dir.path()).unwrap();
        assert_eq!(summary.skipped, vec!["inv-100"]);
        let stored = store.get("inv-100").unwrap().unwrap();
        assert_eq!(stored.authorization.cae.as_deref(), Some("12345678901234"));
    }

    #[test]
    fn list_reports_status_per_invoice() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inv.json"), INVOICE).unwrap();
        std::fs::write(dir.path().join("other.json"), INVOICE.replace("inv-100", "inv-050")).unwrap();
        let store = temp_store();
        import_dir(&store, dir.path()).unwrap();

        let rows = list_rows(&store).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "inv-050");
        assert_eq!(rows[1]["status"], "draft");
        assert_eq!(rows[1]["voucher_type"], "invoice_b");
        assert!(rows[1]["cae"].is_null());
    }

    #[test]
    fn unknown_voucher_codes_are_refused() {
        assert_eq!(known_voucher_type(6).unwrap(), VoucherType::InvoiceB);
        assert!(known_voucher_type(4).is_err());
    }

    #[test]
    fn errors_report_kind_and_retry_hint() {
        let err = anyhow::Error::new(EinvError::TransientNetwork {
            message: "timed out".into(),
            outcome_unknown: true,
        });
        let out = error_json(&err);
        assert_eq!(out["kind"], "transient_network");
        assert_eq!(out["retriable"], true);
        assert_eq!(out["outcome_unknown"], true);
    }

    #[test]
    fn unrecorded_authorization_reports_the_cae() {
        let err = anyhow::Error::new(EinvError::UnrecordedAuthorization {
            invoice_id: "inv-1".into(),
            number: "00001-00000042".into(),
            cae: "12345678901234".into(),
            message: "disk full".into(),
        });
        let out = error_json(&err);
        assert_eq!(out["kind"], "unrecorded_authorization");
        assert_eq!(out["cae"], "12345678901234");
        assert_eq!(out["retriable"], false);
    }
}
