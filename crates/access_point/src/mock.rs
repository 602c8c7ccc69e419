//! In-process stand-in for the tax authority.
//!
//! Speaks the same SOAP dialect as the real WSAA and WSFEv1 endpoints so the
//! full client stack can run without network access or a CMS toolchain.

use super::{
    signer::Signer, wsaa_types::WSAA_NAMESPACE, wsfe_types::WSFE_NAMESPACE, SoapTransport,
};
use ar_einv_core::models::AUTHORITY_TZ;
use ar_einv_core::parsing::{find_descendant, parse_document, text_at_path, xml_escape};
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Signer returning a fixed payload instead of a real CMS structure.
#[derive(Debug, Clone)]
pub struct FixedSigner {
    payload: Vec<u8>,
}

impl FixedSigner {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

impl Default for FixedSigner {
    fn default() -> Self {
        Self::new(b"mock-cms-signature".to_vec())
    }
}

#[async_trait]
impl Signer for FixedSigner {
    async fn sign(&self, _document: &[u8]) -> EinvResult<Vec<u8>> {
        Ok(self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// No response; the request never got processed.
    Timeout,
    /// The authority processed the request but the response was lost.
    TimeoutAfterProcessing,
    /// HTTP 503 from the endpoint.
    Unavailable,
    /// WSAA `coe.alreadyAuthenticated` fault.
    AlreadyAuthenticated,
    Fault { code: String, message: String },
}

#[derive(Debug, Default)]
struct MockState {
    last_vouchers: HashMap<(u32, u32), u64>,
    submitted: Vec<(u32, u32, u64)>,
    calls: Vec<String>,
    failures: HashMap<String, MockFailure>,
    issued_tickets: u64,
}

pub struct MockAuthority {
    state: Mutex<MockState>,
    latency: HashMap<String, Duration>,
    fixed_cae: Option<String>,
    points_of_sale: Vec<(u32, bool)>,
    observations: Vec<(String, String)>,
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAuthority {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            latency: HashMap::new(),
            fixed_cae: None,
            points_of_sale: vec![(1, false)],
            observations: Vec::new(),
        }
    }

    pub fn with_last_voucher(mut self, sales_point: u32, voucher_type: u32, last: u64) -> Self {
        self.state
            .get_mut()
            .last_vouchers
            .insert((sales_point, voucher_type), last);
        self
    }

    /// Issue this CAE instead of a random one.
    pub fn with_cae(mut self, cae: impl Into<String>) -> Self {
        self.fixed_cae = Some(cae.into());
        self
    }

    pub fn with_latency(mut self, operation: &str, latency: Duration) -> Self {
        self.latency.insert(operation.to_string(), latency);
        self
    }

    pub fn with_failure(mut self, operation: &str, failure: MockFailure) -> Self {
        self.state
            .get_mut()
            .failures
            .insert(operation.to_string(), failure);
        self
    }

    pub fn with_points_of_sale(mut self, points: Vec<(u32, bool)>) -> Self {
        self.points_of_sale = points;
        self
    }

    /// Attach a non-fatal observation to every approval.
    pub fn with_observation(mut self, code: &str, message: &str) -> Self {
        self.observations
            .push((code.to_string(), message.to_string()));
        self
    }

    pub async fn set_failure(&self, operation: &str, failure: Option<MockFailure>) {
        let mut state = self.state.lock().await;
        match failure {
            Some(failure) => state.failures.insert(operation.to_string(), failure),
            None => state.failures.remove(operation),
        };
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.iter().filter(|c| c.as_str() == operation).count()
    }

    /// Numbers submitted to FECAESolicitar for the pair, accepted or not, in arrival order.
    pub async fn submitted_numbers(&self, sales_point: u32, voucher_type: u32) -> Vec<u64> {
        let state = self.state.lock().await;
        state
            .submitted
            .iter()
            .filter(|(p, t, _)| *p == sales_point && *t == voucher_type)
            .map(|(_, _, n)| *n)
            .collect()
    }

    pub async fn last_voucher(&self, sales_point: u32, voucher_type: u32) -> u64 {
        let state = self.state.lock().await;
        state
            .last_vouchers
            .get(&(sales_point, voucher_type))
            .copied()
            .unwrap_or(0)
    }

    async fn handle(&self, operation: &str, envelope: &str) -> EinvResult<String> {
        match operation {
            "loginCms" => Ok(self.login().await),
            "FEDummy" => Ok(wsfe_response(
                operation,
                "<AppServer>OK</AppServer><DbServer>OK</DbServer><AuthServer>OK</AuthServer>",
            )),
            "FECompUltimoAutorizado" => self.last_authorized(envelope).await,
            "FEParamGetPtosVenta" => Ok(self.list_points_of_sale(envelope)),
            "FECAESolicitar" => self.solicit_cae(envelope).await,
            other => Ok(fault_envelope(
                "soap:Client",
                &format!("Unknown operation {other}"),
            )),
        }
    }

    async fn login(&self) -> String {
        let serial = {
            let mut state = self.state.lock().await;
            state.issued_tickets += 1;
            state.issued_tickets
        };
        let now = Utc::now().with_timezone(&*AUTHORITY_TZ);
        let ticket = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<loginTicketResponse version="1.0">
  <header>
    <source>CN=wsaahomo, O=AFIP, C=AR, SERIALNUMBER=CUIT 33693450239</source>
    <destination>SERIALNUMBER=CUIT 20000000001, CN=mock</destination>
    <uniqueId>{serial}</uniqueId>
    <generationTime>{}</generationTime>
    <expirationTime>{}</expirationTime>
  </header>
  <credentials>
    <token>mock-token-{serial}</token>
    <sign>mock-sign-{serial}</sign>
  </credentials>
</loginTicketResponse>"#,
            now.to_rfc3339_opts(SecondsFormat::Millis, false),
            (now + ChronoDuration::hours(12)).to_rfc3339_opts(SecondsFormat::Millis, false),
        );
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <loginCmsResponse xmlns="{WSAA_NAMESPACE}">
      <loginCmsReturn>{}</loginCmsReturn>
    </loginCmsResponse>
  </soapenv:Body>
</soapenv:Envelope>"#,
            xml_escape(&ticket)
        )
    }

    async fn last_authorized(&self, envelope: &str) -> EinvResult<String> {
        let req = RequestFields::parse(envelope)?;
        if req.token.is_none() {
            return Ok(token_error("FECompUltimoAutorizado"));
        }
        let (point, kind) = (req.number("PtoVta")?, req.number("CbteTipo")?);
        let last = self.last_voucher(point as u32, kind as u32).await;
        Ok(wsfe_response(
            "FECompUltimoAutorizado",
            &format!("<PtoVta>{point}</PtoVta><CbteTipo>{kind}</CbteTipo><CbteNro>{last}</CbteNro>"),
        ))
    }

    fn list_points_of_sale(&self, envelope: &str) -> String {
        let authenticated = RequestFields::parse(envelope)
            .map(|r| r.token.is_some())
            .unwrap_or(false);
        if !authenticated {
            return token_error("FEParamGetPtosVenta");
        }
        if self.points_of_sale.is_empty() {
            return wsfe_response(
                "FEParamGetPtosVenta",
                "<Errors><Err><Code>602</Code><Msg>Sin Resultados</Msg></Err></Errors>",
            );
        }
        let points: String = self
            .points_of_sale
            .iter()
            .map(|(nro, blocked)| {
                format!(
                    "<PtoVenta><Nro>{nro}</Nro><EmisionTipo>CAE - Ventas</EmisionTipo>\
                     <Bloqueado>{}</Bloqueado><FchBaja>NULL</FchBaja></PtoVenta>",
                    if *blocked { "S" } else { "N" }
                )
            })
            .collect();
        wsfe_response(
            "FEParamGetPtosVenta",
            &format!("<ResultGet>{points}</ResultGet>"),
        )
    }

    async fn solicit_cae(&self, envelope: &str) -> EinvResult<String> {
        let req = RequestFields::parse(envelope)?;
        if req.token.is_none() {
            return Ok(token_error("FECAESolicitar"));
        }
        let point = req.number("PtoVta")? as u32;
        let kind = req.number("CbteTipo")? as u32;
        let from = req.number("CbteDesde")?;
        let to = req.number("CbteHasta")?;
        let issue_date = req
            .text("CbteFch")
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok())
            .unwrap_or_else(|| Utc::now().with_timezone(&*AUTHORITY_TZ).date_naive());

        let accepted = {
            let mut state = self.state.lock().await;
            state.submitted.push((point, kind, from));
            let last = state.last_vouchers.entry((point, kind)).or_insert(0);
            if from == *last + 1 && to == from {
                *last = from;
                true
            } else {
                false
            }
        };

        let header = format!(
            "<FeCabResp><Cuit>20000000001</Cuit><PtoVta>{point}</PtoVta><CbteTipo>{kind}</CbteTipo>\
             <FchProceso>{}</FchProceso><CantReg>1</CantReg><Resultado>{}</Resultado><Reproceso>N</Reproceso></FeCabResp>",
            Utc::now().with_timezone(&*AUTHORITY_TZ).format("%Y%m%d%H%M%S"),
            if accepted { "A" } else { "R" }
        );

        let detail = if accepted {
            let cae = self.fixed_cae.clone().unwrap_or_else(|| {
                rand::thread_rng()
                    .gen_range(10_000_000_000_000u64..100_000_000_000_000u64)
                    .to_string()
            });
            let expiration = (issue_date + ChronoDuration::days(10)).format("%Y%m%d");
            let observations = if self.observations.is_empty() {
                String::new()
            } else {
                let items: String = self
                    .observations
                    .iter()
                    .map(|(code, msg)| {
                        format!("<Obs><Code>{code}</Code><Msg>{}</Msg></Obs>", xml_escape(msg))
                    })
                    .collect();
                format!("<Observaciones>{items}</Observaciones>")
            };
            format!(
                "<CbteDesde>{from}</CbteDesde><CbteHasta>{to}</CbteHasta><Resultado>A</Resultado>\
                 {observations}<CAE>{cae}</CAE><CAEFchVto>{expiration}</CAEFchVto>"
            )
        } else {
            format!(
                "<CbteDesde>{from}</CbteDesde><CbteHasta>{to}</CbteHasta><Resultado>R</Resultado>\
                 <Observaciones><Obs><Code>10016</Code><Msg>El numero o fecha del comprobante no se \
                 corresponde con el proximo a autorizar</Msg></Obs></Observaciones><CAE></CAE><CAEFchVto></CAEFchVto>"
            )
        };

        Ok(wsfe_response(
            "FECAESolicitar",
            &format!("{header}<FeDetResp><FECAEDetResponse>{detail}</FECAEDetResponse></FeDetResp>"),
        ))
    }
}

#[async_trait]
impl SoapTransport for MockAuthority {
    async fn post(&self, _url: &str, soap_action: &str, envelope: String) -> EinvResult<String> {
        let operation = match soap_action.rsplit('/').next() {
            Some(op) if !op.is_empty() => op.to_string(),
            _ => "loginCms".to_string(),
        };
        if let Some(latency) = self.latency.get(&operation) {
            sleep(*latency).await;
        }

        let failure = {
            let mut state = self.state.lock().await;
            state.calls.push(operation.clone());
            state.failures.get(&operation).cloned()
        };
        let timed_out = || EinvError::TransientNetwork {
            message: format!("mock {operation} timed out"),
            outcome_unknown: true,
        };

        match failure {
            None => self.handle(&operation, &envelope).await,
            Some(MockFailure::Timeout) => Err(timed_out()),
            Some(MockFailure::TimeoutAfterProcessing) => {
                self.handle(&operation, &envelope).await?;
                Err(timed_out())
            }
            Some(MockFailure::Unavailable) => Err(EinvError::transient(format!(
                "mock {operation} returned HTTP 503 Service Unavailable"
            ))),
            Some(MockFailure::AlreadyAuthenticated) => Ok(fault_envelope(
                "ns1:coe.alreadyAuthenticated",
                "El CEE ya posee un TA valido para el acceso al WSN solicitado",
            )),
            Some(MockFailure::Fault { code, message }) => Ok(fault_envelope(&code, &message)),
        }
    }
}

/// Fields read back from a request envelope.
struct RequestFields {
    token: Option<String>,
    values: HashMap<&'static str, String>,
}

impl RequestFields {
    const FIELDS: [&'static str; 5] = ["PtoVta", "CbteTipo", "CbteDesde", "CbteHasta", "CbteFch"];

    fn parse(envelope: &str) -> EinvResult<Self> {
        let doc = parse_document(envelope)?;
        let root = doc.root_element();
        let token = find_descendant(root, "Auth").and_then(|auth| text_at_path(auth, &["Token"]));
        let values = Self::FIELDS
            .iter()
            .filter_map(|name| {
                find_descendant(root, name)
                    .and_then(|n| n.text())
                    .map(|t| (*name, t.trim().to_string()))
            })
            .collect();
        Ok(Self { token, values })
    }

    fn text(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn number(&self, name: &str) -> EinvResult<u64> {
        self.values
            .get(name)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EinvError::MalformedResponse(format!("mock request without {name}")))
    }
}

fn wsfe_response(operation: &str, inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <{operation}Response xmlns="{WSFE_NAMESPACE}">
      <{operation}Result>{inner}</{operation}Result>
    </{operation}Response>
  </soap:Body>
</soap:Envelope>"#
    )
}

fn token_error(operation: &str) -> String {
    wsfe_response(
        operation,
        "<Errors><Err><Code>600</Code><Msg>ValidacionDeToken: No aparecio CUIT en lista de relaciones</Msg></Err></Errors>",
    )
}

fn fault_envelope(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <soapenv:Fault>
      <faultcode>{}</faultcode>
      <faultstring>{}</faultstring>
    </soapenv:Fault>
  </soapenv:Body>
</soapenv:Envelope>"#,
        xml_escape(code),
        xml_escape(message)
    )
}
