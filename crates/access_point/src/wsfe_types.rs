//! Electronic billing service (WSFEv1) wire format.

use ar_einv_core::models::{
    format_assigned_number, round2, AuthorizationResult, CaeRequest, Outcome, Ticket,
};
use ar_einv_core::parsing::{
    children_named, find_descendant, find_element, parse_document, soap_body, soap_fault,
    text_at_path, xml_escape,
};
use ar_einv_core::{EinvError, EinvResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

pub const WSFE_NAMESPACE: &str = "http://ar.gov.afip.dif.FEV1/";

/// Authority error code for queries that match nothing.
const NO_RESULTS: &str = "602";

pub fn soap_action(operation: &str) -> String {
    format!("{WSFE_NAMESPACE}{operation}")
}

/// Health of the authority's application, database and authentication servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub app_server: String,
    pub db_server: String,
    pub auth_server: String,
}

impl ServerStatus {
    pub fn is_healthy(&self) -> bool {
        [&self.app_server, &self.db_server, &self.auth_server]
            .iter()
            .all(|s| s.eq_ignore_ascii_case("OK"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointOfSale {
    pub number: u32,
    pub emission_type: String,
    pub blocked: bool,
    pub deactivated_on: Option<String>,
}

/// Authentication block shared by every authenticated operation.
#[derive(Debug, Clone)]
pub struct Auth<'a> {
    pub ticket: &'a Ticket,
    pub cuit: &'a str,
}

impl Auth<'_> {
    fn to_xml(&self) -> String {
        format!(
            "<ar:Auth><ar:Token>{}</ar:Token><ar:Sign>{}</ar:Sign><ar:Cuit>{}</ar:Cuit></ar:Auth>",
            xml_escape(&self.ticket.token),
            xml_escape(&self.ticket.sign),
            xml_escape(self.cuit)
        )
    }
}

fn envelope(operation: &str, inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ar="{WSFE_NAMESPACE}">
  <soapenv:Header/>
  <soapenv:Body>
    <ar:{operation}>{inner}</ar:{operation}>
  </soapenv:Body>
</soapenv:Envelope>"#
    )
}

pub fn dummy_envelope() -> String {
    envelope("FEDummy", "")
}

pub fn last_voucher_envelope(auth: &Auth<'_>, sales_point: u32, voucher_type: u32) -> String {
    envelope(
        "FECompUltimoAutorizado",
        &format!(
            "{}<ar:PtoVta>{}</ar:PtoVta><ar:CbteTipo>{}</ar:CbteTipo>",
            auth.to_xml(),
            sales_point,
            voucher_type
        ),
    )
}

pub fn points_of_sale_envelope(auth: &Auth<'_>) -> String {
    envelope("FEParamGetPtosVenta", &auth.to_xml())
}

fn date(value: NaiveDate) -> String {
    value.format("%Y%m%d").to_string()
}

fn amount(value: f64) -> String {
    format!("{:.2}", round2(value))
}

/// FECAESolicitar for a single voucher (CantReg = 1).
pub fn cae_request_envelope(auth: &Auth<'_>, req: &CaeRequest) -> String {
    let mut det = String::new();
    let _ = write!(
        det,
        "<ar:Concepto>{}</ar:Concepto><ar:DocTipo>{}</ar:DocTipo><ar:DocNro>{}</ar:DocNro>\
         <ar:CbteDesde>{}</ar:CbteDesde><ar:CbteHasta>{}</ar:CbteHasta><ar:CbteFch>{}</ar:CbteFch>\
         <ar:ImpTotal>{}</ar:ImpTotal><ar:ImpTotConc>{}</ar:ImpTotConc><ar:ImpNeto>{}</ar:ImpNeto>\
         <ar:ImpOpEx>{}</ar:ImpOpEx><ar:ImpTrib>{}</ar:ImpTrib><ar:ImpIVA>{}</ar:ImpIVA>",
        req.concept,
        req.doc_type,
        xml_escape(&req.doc_number),
        req.number_from,
        req.number_to,
        date(req.issue_date),
        amount(req.total),
        amount(req.non_taxed),
        amount(req.net),
        amount(req.exempt),
        amount(req.other_taxes),
        amount(req.vat),
    );
    if let (Some(from), Some(to), Some(due)) = (req.service_from, req.service_to, req.payment_due) {
        let _ = write!(
            det,
            "<ar:FchServDesde>{}</ar:FchServDesde><ar:FchServHasta>{}</ar:FchServHasta>\
             <ar:FchVtoPago>{}</ar:FchVtoPago>",
            date(from),
            date(to),
            date(due)
        );
    }
    let _ = write!(
        det,
        "<ar:MonId>{}</ar:MonId><ar:MonCotiz>{}</ar:MonCotiz>",
        xml_escape(&req.currency),
        req.exchange_rate
    );
    if let Some(condition) = req.receiver_condition {
        let _ = write!(
            det,
            "<ar:CondicionIVAReceptorId>{condition}</ar:CondicionIVAReceptorId>"
        );
    }
    if !req.associated.is_empty() {
        det.push_str("<ar:CbtesAsoc>");
        for assoc in &req.associated {
            let _ = write!(
                det,
                "<ar:CbteAsoc><ar:Tipo>{}</ar:Tipo><ar:PtoVta>{}</ar:PtoVta><ar:Nro>{}</ar:Nro>",
                assoc.voucher_type, assoc.sales_point, assoc.number
            );
            if let Some(cuit) = &assoc.cuit {
                let _ = write!(det, "<ar:Cuit>{}</ar:Cuit>", xml_escape(cuit));
            }
            if let Some(fch) = assoc.date {
                let _ = write!(det, "<ar:CbteFch>{}</ar:CbteFch>", date(fch));
            }
            det.push_str("</ar:CbteAsoc>");
        }
        det.push_str("</ar:CbtesAsoc>");
    }
    if req.other_taxes > 0.0 {
        let base = if req.net > 0.0 { req.net } else { req.total };
        let _ = write!(
            det,
            "<ar:Tributos><ar:Tributo><ar:Id>99</ar:Id><ar:Desc>Otros tributos</ar:Desc>\
             <ar:BaseImp>{}</ar:BaseImp><ar:Alic>{}</ar:Alic><ar:Importe>{}</ar:Importe>\
             </ar:Tributo></ar:Tributos>",
            amount(base),
            amount(req.other_taxes / base * 100.0),
            amount(req.other_taxes)
        );
    }
    if !req.vat_breakdown.is_empty() {
        det.push_str("<ar:Iva>");
        for vat in &req.vat_breakdown {
            let _ = write!(
                det,
                "<ar:AlicIva><ar:Id>{}</ar:Id><ar:BaseImp>{}</ar:BaseImp><ar:Importe>{}</ar:Importe></ar:AlicIva>",
                vat.rate_code,
                amount(vat.base),
                amount(vat.amount)
            );
        }
        det.push_str("</ar:Iva>");
    }

    let inner = format!(
        "{}<ar:FeCAEReq><ar:FeCabReq><ar:CantReg>1</ar:CantReg><ar:PtoVta>{}</ar:PtoVta>\
         <ar:CbteTipo>{}</ar:CbteTipo></ar:FeCabReq><ar:FeDetReq><ar:FECAEDetRequest>{}\
         </ar:FECAEDetRequest></ar:FeDetReq></ar:FeCAEReq>",
        auth.to_xml(),
        req.sales_point,
        req.voucher_type,
        det
    );
    envelope("FECAESolicitar", &inner)
}

/// `code: message` entries of an `Errors`/`Observaciones`/`Events` list.
fn messages(node: roxmltree::Node<'_, '_>, list: &str, item: &str) -> Vec<(String, String)> {
    let Some(list) = find_element(node, &[list]) else {
        return Vec::new();
    };
    children_named(list, item)
        .map(|n| {
            (
                text_at_path(n, &["Code"]).unwrap_or_default(),
                text_at_path(n, &["Msg"]).unwrap_or_default(),
            )
        })
        .collect()
}

fn render(entries: &[(String, String)]) -> Vec<String> {
    entries
        .iter()
        .map(|(code, msg)| format!("{code}: {msg}"))
        .collect()
}

/// Locates `<{operation}Result>`, turning SOAP faults into authority faults.
fn with_result<T>(
    xml: &str,
    operation: &str,
    f: impl FnOnce(roxmltree::Node<'_, '_>) -> EinvResult<T>,
) -> EinvResult<T> {
    let doc = parse_document(xml)?;
    let body = soap_body(&doc)?;
    if let Some(fault) = soap_fault(body) {
        return Err(EinvError::AuthorityFault {
            code: fault.code,
            message: fault.message,
        });
    }
    let result_name = format!("{operation}Result");
    let result = find_descendant(body, &result_name).ok_or_else(|| {
        EinvError::MalformedResponse(format!("{operation} response without {result_name}"))
    })?;
    for (code, msg) in messages(result, "Events", "Evt") {
        tracing::debug!(%operation, %code, %msg, "authority event");
    }
    f(result)
}

fn fail_on_errors(result: roxmltree::Node<'_, '_>) -> EinvResult<()> {
    let errors = messages(result, "Errors", "Err");
    match errors.into_iter().next() {
        Some((code, message)) => Err(EinvError::AuthorityFault { code, message }),
        None => Ok(()),
    }
}

pub fn parse_dummy(xml: &str) -> EinvResult<ServerStatus> {
    with_result(xml, "FEDummy", |result| {
        let field = |name: &str| text_at_path(result, &[name]).unwrap_or_default();
        Ok(ServerStatus {
            app_server: field("AppServer"),
            db_server: field("DbServer"),
            auth_server: field("AuthServer"),
        })
    })
}

pub fn parse_last_voucher(xml: &str) -> EinvResult<u64> {
    with_result(xml, "FECompUltimoAutorizado", |result| {
        fail_on_errors(result)?;
        let raw = text_at_path(result, &["CbteNro"]).ok_or_else(|| {
            EinvError::MalformedResponse("FECompUltimoAutorizado without CbteNro".to_string())
        })?;
        raw.parse()
            .map_err(|_| EinvError::MalformedResponse(format!("invalid CbteNro {raw}")))
    })
}

pub fn parse_points_of_sale(xml: &str) -> EinvResult<Vec<PointOfSale>> {
    with_result(xml, "FEParamGetPtosVenta", |result| {
        let errors = messages(result, "Errors", "Err");
        if let Some((code, message)) = errors.into_iter().next() {
            if code == NO_RESULTS {
                return Ok(Vec::new());
            }
            return Err(EinvError::AuthorityFault { code, message });
        }
        let Some(list) = find_element(result, &["ResultGet"]) else {
            return Ok(Vec::new());
        };
        children_named(list, "PtoVenta")
            .map(|p| {
                let raw = text_at_path(p, &["Nro"]).unwrap_or_default();
                let number = raw.parse().map_err(|_| {
                    EinvError::MalformedResponse(format!("invalid point of sale number {raw:?}"))
                })?;
                Ok(PointOfSale {
                    number,
                    emission_type: text_at_path(p, &["EmisionTipo"]).unwrap_or_default(),
                    blocked: text_at_path(p, &["Bloqueado"]).as_deref() == Some("S"),
                    deactivated_on: text_at_path(p, &["FchBaja"])
                        .filter(|d| !d.eq_ignore_ascii_case("NULL")),
                })
            })
            .collect()
    })
}

/// Reads the FECAESolicitar answer for the voucher submitted as `number`.
///
/// A CAE means approval. Anything else is a rejection whose reasons are the
/// authority's `Errors`, falling back to the voucher's observations, which is
/// where per-voucher rejection causes are reported.
pub fn parse_cae_response(
    xml: &str,
    sales_point: u32,
    number: u64,
) -> EinvResult<AuthorizationResult> {
    with_result(xml, "FECAESolicitar", |result| {
        let errors = render(&messages(result, "Errors", "Err"));
        let detail = find_element(result, &["FeDetResp", "FECAEDetResponse"]);

        let (cae, cae_expiration, observations, number) = match detail {
            Some(det) => {
                let cae = text_at_path(det, &["CAE"]);
                let cae_expiration = match text_at_path(det, &["CAEFchVto"]) {
                    Some(raw) => Some(NaiveDate::parse_from_str(&raw, "%Y%m%d").map_err(|_| {
                        EinvError::MalformedResponse(format!("invalid CAEFchVto {raw}"))
                    })?),
                    None => None,
                };
                let assigned = text_at_path(det, &["CbteDesde"])
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(number);
                let observations = render(&messages(det, "Observaciones", "Obs"));
                (cae, cae_expiration, observations, assigned)
            }
            None => (None, None, Vec::new(), number),
        };

        let assigned_number = format_assigned_number(sales_point, number);
        match (cae, cae_expiration) {
            (Some(cae), Some(expiration)) => Ok(AuthorizationResult {
                outcome: Outcome::Approved,
                cae: Some(cae),
                cae_expiration: Some(expiration),
                sales_point,
                number,
                assigned_number,
                observations,
                errors: Vec::new(),
            }),
            (Some(_), None) => Err(EinvError::MalformedResponse(
                "CAE issued without expiration date".to_string(),
            )),
            (None, _) => {
                let errors = if !errors.is_empty() {
                    errors
                } else if !observations.is_empty() {
                    observations.clone()
                } else {
                    vec!["rejected without a reason from the authority".to_string()]
                };
                Ok(AuthorizationResult {
                    outcome: Outcome::Rejected,
                    cae: None,
                    cae_expiration: None,
                    sales_point,
                    number,
                    assigned_number,
                    observations,
                    errors,
                })
            }
        }
    })
}
