//! Ticket request construction and CMS signing.
//!
//! The authentication service expects a login ticket request (TRA) signed as
//! CMS/PKCS#7 with the content attached, DER encoded and then base64 wrapped.

use ar_einv_core::models::{SigningIdentity, AUTHORITY_TZ};
use ar_einv_core::parsing::xml_escape;
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const TICKET_WINDOW_HOURS: i64 = 12;

/// Produces a non-detached CMS signature (DER) over `document`.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, document: &[u8]) -> EinvResult<Vec<u8>>;
}

/// Login ticket request document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTicketRequest {
    pub unique_id: i64,
    pub generation_time: DateTime<FixedOffset>,
    pub expiration_time: DateTime<FixedOffset>,
    pub service: String,
}

impl LoginTicketRequest {
    /// Request window of twelve hours from `now`, on the authority's UTC-3 clock.
    pub fn new(service: &str, now: DateTime<Utc>) -> Self {
        let generation_time = now.with_timezone(&*AUTHORITY_TZ);
        Self {
            unique_id: now.timestamp(),
            generation_time,
            expiration_time: generation_time + Duration::hours(TICKET_WINDOW_HOURS),
            service: service.to_string(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<loginTicketRequest version="1.0">
  <header>
    <uniqueId>{}</uniqueId>
    <generationTime>{}</generationTime>
    <expirationTime>{}</expirationTime>
  </header>
  <service>{}</service>
</loginTicketRequest>"#,
            self.unique_id,
            self.generation_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.expiration_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            xml_escape(&self.service),
        )
    }
}

/// Builds login ticket requests and wraps them in a base64 CMS envelope.
#[derive(Clone)]
pub struct TicketRequestSigner {
    signer: Arc<dyn Signer>,
}

impl TicketRequestSigner {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    pub async fn build_and_sign(&self, service: &str) -> EinvResult<String> {
        self.build_and_sign_at(service, Utc::now()).await
    }

    pub async fn build_and_sign_at(&self, service: &str, now: DateTime<Utc>) -> EinvResult<String> {
        let request = LoginTicketRequest::new(service, now);
        let der = self.signer.sign(request.to_xml().as_bytes()).await?;
        if der.is_empty() {
            return Err(EinvError::Signing("signer produced an empty CMS".to_string()));
        }
        tracing::debug!(%service, unique_id = request.unique_id, "login ticket request signed");
        Ok(BASE64_STANDARD.encode(der))
    }
}

/// Signs through the `openssl cms` command line tool.
pub struct OpensslCmsSigner {
    binary: String,
    identity: SigningIdentity,
}

impl OpensslCmsSigner {
    pub fn new(binary: impl Into<String>, identity: SigningIdentity) -> Self {
        Self {
            binary: binary.into(),
            identity,
        }
    }
}

fn pem_temp_file(contents: &str) -> EinvResult<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| EinvError::Signing(format!("cannot create temp file for PEM: {e}")))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| EinvError::Signing(format!("cannot write PEM temp file: {e}")))?;
    Ok(file)
}

#[async_trait]
impl Signer for OpensslCmsSigner {
    async fn sign(&self, document: &[u8]) -> EinvResult<Vec<u8>> {
        // openssl needs key material on disk; temp files are removed on drop.
        let cert = pem_temp_file(&self.identity.certificate_pem)?;
        let key = pem_temp_file(&self.identity.private_key_pem)?;

        let mut child = Command::new(&self.binary)
            .args(["cms", "-sign", "-signer"])
            .arg(cert.path())
            .arg("-inkey")
            .arg(key.path())
            .args(["-nodetach", "-outform", "DER", "-binary"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EinvError::Signing(format!("failed to run {}: {e}", self.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(document)
                .await
                .map_err(|e| EinvError::Signing(format!("failed to feed {}: {e}", self.binary)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EinvError::Signing(format!("{} did not complete: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(EinvError::Signing(format!(
                "{} cms exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}
