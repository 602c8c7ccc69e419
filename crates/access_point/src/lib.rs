use ar_einv_core::models::{AuthorizationResult, CaeRequest, Ticket};
use ar_einv_core::EinvResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Homologation,
    Production,
}

impl Environment {
    pub fn from_production_flag(production: bool) -> Self {
        if production {
            Environment::Production
        } else {
            Environment::Homologation
        }
    }

    pub fn wsaa_url(self) -> &'static str {
        match self {
            Environment::Homologation => "https://wsaahomo.afip.gov.ar/ws/services/LoginCms",
            Environment::Production => "https://wsaa.afip.gov.ar/ws/services/LoginCms",
        }
    }

    pub fn wsfe_url(self) -> &'static str {
        match self {
            Environment::Homologation => "https://wswhomo.afip.gov.ar/wsfev1/service.asmx",
            Environment::Production => "https://servicios1.afip.gov.ar/wsfev1/service.asmx",
        }
    }
}

/// Carries SOAP 1.1 envelopes to an authority endpoint and returns the raw response.
///
/// Implementations return the body for SOAP faults too, so callers can tell
/// authority faults apart from transport failures.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    async fn post(&self, url: &str, soap_action: &str, envelope: String) -> EinvResult<String>;
}

/// Source of valid access tickets for a named service.
#[async_trait]
pub trait TicketProvider: Send + Sync {
    async fn ticket(&self, service: &str) -> EinvResult<Ticket>;
}

/// Invoice authorization against the billing service.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn last_authorized(&self, sales_point: u32, voucher_type: u32) -> EinvResult<u64>;
    async fn authorize(&self, request: &CaeRequest) -> EinvResult<AuthorizationResult>;
}

pub mod keyed_lock;
pub mod mock;
pub mod signer;
pub mod ticket_cache;
pub mod transport;
pub mod wsaa;
pub mod wsaa_types;
pub mod wsfe;
pub mod wsfe_types;
