use super::SoapTransport;
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 512;

/// HTTPS transport for the authority's SOAP 1.1 endpoints.
#[derive(Clone)]
pub struct HttpSoapTransport {
    http_client: reqwest::Client,
}

impl HttpSoapTransport {
    /// Every call is bounded by `timeout`; expiry is reported as a transient error.
    pub fn new(timeout: Duration) -> EinvResult<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| EinvError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Arc::new(Self { http_client }))
    }
}

#[async_trait]
impl SoapTransport for HttpSoapTransport {
    async fn post(&self, url: &str, soap_action: &str, envelope: String) -> EinvResult<String> {
        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{soap_action}\""))
            .body(envelope)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(|e| EinvError::TransientNetwork {
            message: format!("failed to read response from {url}: {e}"),
            outcome_unknown: true,
        })?;

        // SOAP 1.1 faults travel with HTTP 500; let the protocol layer read them.
        if status.is_success() || body.contains("Fault>") {
            return Ok(body);
        }

        if status.is_server_error() {
            tracing::warn!(%url, %status, "authority endpoint unavailable");
            return Err(EinvError::transient(format!("{url} returned HTTP {status}")));
        }

        Err(EinvError::AuthorityFault {
            code: format!("http.{}", status.as_u16()),
            message: truncate(&body),
        })
    }
}

fn classify_send_error(err: reqwest::Error) -> EinvError {
    if err.is_builder() {
        return EinvError::Configuration(format!("invalid request: {err}"));
    }
    if err.is_connect() {
        return EinvError::TransientNetwork {
            message: format!("connection failed: {err}"),
            outcome_unknown: false,
        };
    }
    // Past the connect phase the authority may already have processed the request.
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        format!("request failed: {err}")
    };
    EinvError::TransientNetwork {
        message,
        outcome_unknown: true,
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_bodies_on_char_boundary() {
        let body = "ñ".repeat(400);
        let out = truncate(&body);
        assert!(out.ends_with("..."));
        assert!(out.len() <= MAX_ERROR_BODY + 3);
    }

    #[test]
    fn malformed_request_is_not_retried() {
        let err = reqwest::Client::new()
            .post("not a url")
            .build()
            .unwrap_err();
        let classified = classify_send_error(err);
        assert!(matches!(classified, EinvError::Configuration(_)), "{classified:?}");
        assert!(!classified.is_retriable());
    }

    #[tokio::test]
    #[ignore = "dials a closed port on the local host"]
    async fn unreachable_endpoint_is_transient() {
        let transport = HttpSoapTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport
            .post("http://127.0.0.1:9/service", "", "<x/>".to_string())
            .await
            .unwrap_err();
        assert!(err.is_retriable(), "{err:?}");
    }
}
