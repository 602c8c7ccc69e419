//! Invoice data mapper and pre-flight validator.
//!
//! Translates a domain [`Invoice`] into the billing service's wire schema and
//! collects every structural problem the authority would reject it for. An
//! invoice with a non-empty error list must never be submitted: doing so would
//! spend a sequential number on a request that is guaranteed to fail.

mod rules;

use crate::codes::{vat_rate_code, VoucherClass};
use crate::models::{round2, AssociatedRef, CaeRequest, Invoice, VatAmount};

/// Maps `invoice` to its wire form and returns it along with all validation errors.
pub fn map_and_validate(invoice: &Invoice) -> (CaeRequest, Vec<String>) {
    let mut errs = Vec::new();
    let vat_breakdown = aggregate_vat(invoice, &mut errs);
    let request = map_invoice(invoice, vat_breakdown);

    rules::issuer_checks(invoice, &mut errs);
    rules::customer_checks(invoice, &mut errs);
    rules::voucher_checks(invoice, &mut errs);
    rules::amount_checks(invoice, &request, &mut errs);

    (request, errs)
}

/// Convenience wrapper returning the request only when it is fit for submission.
pub fn validate(invoice: &Invoice) -> Result<CaeRequest, Vec<String>> {
    let (request, errs) = map_and_validate(invoice);
    if errs.is_empty() {
        Ok(request)
    } else {
        Err(errs)
    }
}

fn aggregate_vat(invoice: &Invoice, errs: &mut Vec<String>) -> Vec<VatAmount> {
    if invoice.voucher_type.class() == VoucherClass::C {
        return Vec::new();
    }
    let mut breakdown: Vec<(u32, f64, f64)> = Vec::new();
    for (idx, line) in invoice.lines.iter().enumerate() {
        let Some(rate) = line.vat_rate else {
            continue;
        };
        let Some(code) = vat_rate_code(rate) else {
            errs.push(format!(
                "Line {}: VAT rate {}% has no authority code",
                idx + 1,
                rate
            ));
            continue;
        };
        match breakdown.iter_mut().find(|(c, _, _)| *c == code) {
            Some(entry) => entry.1 += line.amount(),
            None => breakdown.push((code, line.amount(), rate)),
        }
    }
    breakdown
        .into_iter()
        .map(|(rate_code, base, rate)| VatAmount {
            rate_code,
            base: round2(base),
            amount: round2(base * rate / 100.0),
        })
        .collect()
}

fn map_invoice(invoice: &Invoice, vat_breakdown: Vec<VatAmount>) -> CaeRequest {
    let totals = &invoice.totals;
    let (service_from, service_to, payment_due) =
        match (&invoice.service_period, invoice.concept.requires_service_period()) {
            (Some(period), true) => (Some(period.from), Some(period.to), Some(period.payment_due)),
            _ => (None, None, None),
        };
    let associated = invoice
        .associated
        .iter()
        .map(|a| AssociatedRef {
            voucher_type: a.voucher_type.code(),
            sales_point: a.sales_point,
            number: a.number,
            cuit: a.issuer_cuit.clone(),
            date: a.issue_date,
        })
        .collect();

    CaeRequest {
        sales_point: invoice.sales_point,
        voucher_type: invoice.voucher_type.code(),
        concept: invoice.concept.code(),
        doc_type: invoice.customer.document_type.code(),
        doc_number: invoice.customer.document_number.trim().to_string(),
        number_from: 0,
        number_to: 0,
        issue_date: invoice.issue_date,
        total: round2(totals.grand_total),
        net: round2(totals.net),
        exempt: round2(totals.exempt),
        non_taxed: round2(totals.non_taxed),
        vat: round2(totals.vat),
        other_taxes: round2(totals.other_taxes),
        service_from,
        service_to,
        payment_due,
        currency: invoice.currency.clone(),
        exchange_rate: invoice.exchange_rate,
        receiver_condition: Some(invoice.customer.tax_condition.code()),
        vat_breakdown,
        associated,
    }
}
