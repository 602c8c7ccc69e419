//! Authentication service (WSAA) wire format.
//!
//! `loginCms` answers with the ticket as an XML document serialized into the
//! text of `loginCmsReturn`, so decoding happens in two stages: the SOAP
//! envelope first, then the embedded ticket document.

use ar_einv_core::models::Ticket;
use ar_einv_core::parsing::{
    find_descendant, parse_document, soap_body, soap_fault, text_at_path, xml_escape, SoapFault,
};
use ar_einv_core::{EinvError, EinvResult};
use chrono::{DateTime, FixedOffset};

pub const WSAA_NAMESPACE: &str = "http://wsaa.view.sua.dvadac.desein.afip.gov";

/// Outcome of the first decoding stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    /// Raw ticket document carried by `loginCmsReturn`.
    TicketDocument(String),
    Fault(SoapFault),
}

pub fn login_cms_envelope(cms_base64: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:wsaa="{}">
  <soapenv:Header/>
  <soapenv:Body>
    <wsaa:loginCms>
      <wsaa:in0>{}</wsaa:in0>
    </wsaa:loginCms>
  </soapenv:Body>
</soapenv:Envelope>"#,
        WSAA_NAMESPACE,
        xml_escape(cms_base64)
    )
}

/// Stage one: unwrap the SOAP envelope.
pub fn parse_login_response(xml: &str) -> EinvResult<LoginResponse> {
    let doc = parse_document(xml)?;
    let body = soap_body(&doc)?;
    if let Some(fault) = soap_fault(body) {
        return Ok(LoginResponse::Fault(fault));
    }
    let ret = find_descendant(body, "loginCmsReturn").ok_or_else(|| {
        EinvError::MalformedResponse("loginCms response without loginCmsReturn".to_string())
    })?;
    let text = ret.text().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(EinvError::MalformedResponse(
            "empty loginCmsReturn".to_string(),
        ));
    }
    Ok(LoginResponse::TicketDocument(text.to_string()))
}

/// Stage two: read the ticket document issued for `service`.
pub fn parse_ticket_document(xml: &str, service: &str) -> EinvResult<Ticket> {
    let doc = parse_document(xml)?;
    let root = doc.root_element();
    if root.tag_name().name() != "loginTicketResponse" {
        return Err(EinvError::MalformedResponse(format!(
            "expected loginTicketResponse, found <{}>",
            root.tag_name().name()
        )));
    }

    let required = |path: &[&str]| {
        text_at_path(root, path).ok_or_else(|| {
            EinvError::MalformedResponse(format!("ticket document missing {}", path.join("/")))
        })
    };

    Ok(Ticket {
        token: required(&["credentials", "token"])?,
        sign: required(&["credentials", "sign"])?,
        generation_time: parse_time(&required(&["header", "generationTime"])?)?,
        expiration_time: parse_time(&required(&["header", "expirationTime"])?)?,
        service: service.to_string(),
        destination: text_at_path(root, &["header", "destination"]).unwrap_or_default(),
    })
}

fn parse_time(value: &str) -> EinvResult<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| EinvError::MalformedResponse(format!("invalid ticket timestamp {value}: {e}")))
}

/// The authority refuses to issue a second ticket while one is still valid.
pub fn is_already_authenticated(fault: &SoapFault) -> bool {
    fault.code.contains("alreadyAuthenticated")
        || fault.message.contains("ya posee un TA valido")
}
