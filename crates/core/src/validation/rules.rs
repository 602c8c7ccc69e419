use crate::codes::{DocumentType, TaxCondition, VoucherClass};
use crate::models::{CaeRequest, Invoice};

const MAX_SALES_POINT: u32 = 99_999;
const MIN_TAX_ID_LEN: usize = 11;
const TOLERANCE: f64 = 0.01 + 1e-9;

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

pub fn issuer_checks(invoice: &Invoice, errs: &mut Vec<String>) {
    let cuit = invoice.issuer.cuit.trim();
    if !is_digits(cuit) || cuit.len() < MIN_TAX_ID_LEN {
        errs.push(format!(
            "Issuer tax id must have at least {MIN_TAX_ID_LEN} digits"
        ));
    }

    let class = invoice.voucher_type.class();
    match invoice.issuer.tax_condition {
        TaxCondition::Registered if class == VoucherClass::C => {
            errs.push("VAT-registered issuers cannot issue class C vouchers".to_string());
        }
        TaxCondition::Monotributo | TaxCondition::Exempt if class != VoucherClass::C => {
            errs.push("Issuers outside VAT registration may only issue class C vouchers".to_string());
        }
        _ => {}
    }
}

pub fn customer_checks(invoice: &Invoice, errs: &mut Vec<String>) {
    let customer = &invoice.customer;
    let number = customer.document_number.trim();
    if !is_digits(number) {
        errs.push("Customer document number must contain digits only".to_string());
    }

    if invoice.voucher_type.class() == VoucherClass::A {
        if customer.document_type != DocumentType::Cuit {
            errs.push("Invoice A requires a CUIT customer document".to_string());
        } else if number.len() != MIN_TAX_ID_LEN {
            errs.push("Customer CUIT must have 11 digits".to_string());
        }
    }
}

pub fn voucher_checks(invoice: &Invoice, errs: &mut Vec<String>) {
    if invoice.sales_point == 0 || invoice.sales_point > MAX_SALES_POINT {
        errs.push(format!(
            "Sales point must be between 1 and {MAX_SALES_POINT}"
        ));
    }

    if invoice.lines.is_empty() {
        errs.push("At least one line item is required".to_string());
    }

    if invoice.concept.requires_service_period() {
        match &invoice.service_period {
            None => errs.push(
                "Service dates (from, to, payment due) are required when the concept includes services"
                    .to_string(),
            ),
            Some(period) if period.from > period.to => {
                errs.push("Service period start must not be after its end".to_string());
            }
            Some(_) => {}
        }
    }

    if invoice.voucher_type.is_note() && invoice.associated.is_none() {
        errs.push("Credit and debit notes require an associated voucher".to_string());
    }
}

pub fn amount_checks(invoice: &Invoice, req: &CaeRequest, errs: &mut Vec<String>) {
    if req.total.abs() < 0.005 {
        errs.push("Grand total must be non-zero".to_string());
    }

    let sum = req.component_sum();
    if (sum - req.total).abs() > TOLERANCE {
        errs.push(format!(
            "Grand total {:.2} does not equal net + exempt + non-taxed + VAT + other taxes ({:.2})",
            req.total, sum
        ));
    }

    let components = [
        ("Net", req.net),
        ("Exempt", req.exempt),
        ("Non-taxed", req.non_taxed),
        ("VAT", req.vat),
        ("Other taxes", req.other_taxes),
    ];
    for (name, value) in components {
        if value < 0.0 {
            errs.push(format!("{name} amount must not be negative"));
        }
    }

    if req.currency.len() != 3 {
        errs.push("Currency must be a 3-letter authority code".to_string());
    }
    if req.exchange_rate <= 0.0 {
        errs.push("Exchange rate must be positive".to_string());
    }

    if invoice.voucher_type.class() == VoucherClass::C {
        let has_vat_lines = invoice.lines.iter().any(|l| l.vat_rate.is_some());
        if req.vat.abs() > 0.0 || has_vat_lines {
            errs.push("class C vouchers must not carry VAT".to_string());
        }
        return;
    }

    let vat_sum: f64 = req.vat_breakdown.iter().map(|v| v.amount).sum();
    let base_sum: f64 = req.vat_breakdown.iter().map(|v| v.base).sum();
    if (vat_sum - req.vat).abs() > TOLERANCE {
        errs.push(format!(
            "VAT breakdown amounts ({:.2}) do not add up to the VAT total ({:.2})",
            vat_sum, req.vat
        ));
    }
    if (base_sum - req.net).abs() > TOLERANCE {
        errs.push(format!(
            "VAT breakdown taxable bases ({:.2}) do not add up to the net total ({:.2})",
            base_sum, req.net
        ));
    }
}
