use crate::codes::{Concept, DocumentType, TaxCondition, VoucherType};
use crate::error::{EinvError, EinvResult};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// The authority operates on a fixed UTC-3 clock regardless of the host timezone.
pub static AUTHORITY_TZ: Lazy<FixedOffset> =
    Lazy::new(|| FixedOffset::west_opt(3 * 3600).unwrap_or_else(|| Utc.fix()));

pub fn authority_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&*AUTHORITY_TZ)
}

/// Rounds an amount to cents, the precision the authority cross-checks totals at.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Certificate and private key used to sign ticket requests.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("certificate_pem", &format!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Access ticket (TA) issued by the authentication service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub token: String,
    pub sign: String,
    pub generation_time: DateTime<FixedOffset>,
    pub expiration_time: DateTime<FixedOffset>,
    pub service: String,
    pub destination: String,
}

impl Ticket {
    /// A ticket is usable only while `now + margin` is still before its expiration.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expiration_time.with_timezone(&Utc)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    pub name: String,
    pub cuit: String,
    pub tax_condition: TaxCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub tax_condition: TaxCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    /// VAT rate in percent; `None` for lines outside VAT (exempt, non-taxed, class C).
    #[serde(default)]
    pub vat_rate: Option<f64>,
}

impl LineItem {
    pub fn amount(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default)]
    pub net: f64,
    #[serde(default)]
    pub exempt: f64,
    #[serde(default)]
    pub non_taxed: f64,
    #[serde(default)]
    pub vat: f64,
    #[serde(default)]
    pub other_taxes: f64,
    pub grand_total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePeriod {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub payment_due: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociatedVoucher {
    pub voucher_type: VoucherType,
    pub sales_point: u32,
    pub number: u64,
    #[serde(default)]
    pub issuer_cuit: Option<String>,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    #[default]
    Draft,
    ValidationFailed,
    Rejected,
    Authorized,
}

/// Authorization fields the orchestrator writes back onto an invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    #[serde(default)]
    pub status: AuthorizationStatus,
    pub cae: Option<String>,
    pub cae_expiration: Option<NaiveDate>,
    pub assigned_number: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Invoice entity as owned by the sales domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub issuer: Issuer,
    pub customer: Customer,
    pub sales_point: u32,
    pub voucher_type: VoucherType,
    pub concept: Concept,
    pub issue_date: NaiveDate,
    #[serde(default)]
    pub service_period: Option<ServicePeriod>,
    pub lines: Vec<LineItem>,
    pub totals: Totals,
    #[serde(default)]
    pub associated: Option<AssociatedVoucher>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,
    #[serde(default)]
    pub authorization: AuthorizationRecord,
}

fn default_currency() -> String {
    "PES".to_string()
}

fn default_exchange_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatAmount {
    pub rate_code: u32,
    pub base: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedRef {
    pub voucher_type: u32,
    pub sales_point: u32,
    pub number: u64,
    pub cuit: Option<String>,
    pub date: Option<NaiveDate>,
}

/// Invoice in the billing service's wire schema (FECAEDetRequest), amounts rounded to cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaeRequest {
    pub sales_point: u32,
    pub voucher_type: u32,
    pub concept: u32,
    pub doc_type: u32,
    pub doc_number: String,
    pub number_from: u64,
    pub number_to: u64,
    pub issue_date: NaiveDate,
    pub total: f64,
    pub net: f64,
    pub exempt: f64,
    pub non_taxed: f64,
    pub vat: f64,
    pub other_taxes: f64,
    pub service_from: Option<NaiveDate>,
    pub service_to: Option<NaiveDate>,
    pub payment_due: Option<NaiveDate>,
    pub currency: String,
    pub exchange_rate: f64,
    pub receiver_condition: Option<u32>,
    pub vat_breakdown: Vec<VatAmount>,
    pub associated: Vec<AssociatedRef>,
}

impl CaeRequest {
    /// Single-voucher batch: both ends of the range carry the same number.
    pub fn numbered(&self, number: u64) -> Self {
        let mut req = self.clone();
        req.number_from = number;
        req.number_to = number;
        req
    }

    /// Sum of the total's components, which must reproduce `total`.
    pub fn component_sum(&self) -> f64 {
        round2(self.net + self.exempt + self.non_taxed + self.vat + self.other_taxes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Approved,
    Rejected,
}

/// Outcome of one submission attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub outcome: Outcome,
    pub cae: Option<String>,
    pub cae_expiration: Option<NaiveDate>,
    pub sales_point: u32,
    pub number: u64,
    pub assigned_number: String,
    pub observations: Vec<String>,
    pub errors: Vec<String>,
}

impl AuthorizationResult {
    pub fn is_approved(&self) -> bool {
        self.outcome == Outcome::Approved
    }

    /// Turns a rejection into `EinvError::Rejection` for callers that only proceed on approval.
    pub fn ensure_approved(self) -> EinvResult<Self> {
        match self.outcome {
            Outcome::Approved => Ok(self),
            Outcome::Rejected => Err(EinvError::Rejection {
                number: self.assigned_number,
                errors: self.errors,
            }),
        }
    }
}

/// `PPPPP-NNNNNNNN`, the printed form of a voucher number.
pub fn format_assigned_number(sales_point: u32, number: u64) -> String {
    format!("{:05}-{:08}", sales_point, number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ticket_expiring_at(expiration: DateTime<FixedOffset>) -> Ticket {
        Ticket {
            token: "tok".into(),
            sign: "sig".into(),
            generation_time: expiration - Duration::hours(12),
            expiration_time: expiration,
            service: "wsfe".into(),
            destination: "CN=wsfe".into(),
        }
    }

    #[test]
    fn ticket_usable_only_outside_safety_margin() {
        let exp = AUTHORITY_TZ.with_ymd_and_hms(2024, 5, 10, 20, 0, 0).unwrap();
        let ticket = ticket_expiring_at(exp);
        let margin = Duration::hours(1);

        let early = Utc.with_ymd_and_hms(2024, 5, 10, 21, 59, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 5, 10, 22, 30, 0).unwrap();
        assert!(ticket.is_usable_at(early, margin));
        assert!(!ticket.is_usable_at(late, margin));
    }

    #[test]
    fn assigned_number_is_zero_padded() {
        assert_eq!(format_assigned_number(1, 42), "00001-00000042");
        assert_eq!(format_assigned_number(12345, 12345678), "12345-12345678");
    }

    #[test]
    fn rejected_result_converts_to_rejection_error() {
        let result = AuthorizationResult {
            outcome: Outcome::Rejected,
            cae: None,
            cae_expiration: None,
            sales_point: 2,
            number: 7,
            assigned_number: format_assigned_number(2, 7),
            observations: vec![],
            errors: vec!["10016: number out of sequence".into()],
        };
        match result.ensure_approved() {
            Err(EinvError::Rejection { number, errors }) => {
                assert_eq!(number, "00002-00000007");
                assert_eq!(errors.len(), 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
