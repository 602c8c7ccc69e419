use super::{
    keyed_lock::KeyedLock,
    wsfe_types::{
        cae_request_envelope, dummy_envelope, last_voucher_envelope, parse_cae_response,
        parse_dummy, parse_last_voucher, parse_points_of_sale, points_of_sale_envelope,
        soap_action, Auth, PointOfSale, ServerStatus,
    },
    BillingService, SoapTransport, TicketProvider,
};
use ar_einv_core::models::{AuthorizationResult, CaeRequest};
use ar_einv_core::{EinvError, EinvResult};
use async_trait::async_trait;
use std::sync::Arc;

pub const WSFE_SERVICE: &str = "wsfe";
const MAX_VOUCHER_NUMBER: u64 = 99_999_999;

/// Client for the electronic billing service (WSFEv1).
///
/// The authority is the only source of truth for voucher numbering: every
/// submission re-reads the last authorized number and nothing is cached or
/// incremented locally between calls.
pub struct WsfeClient {
    url: String,
    cuit: String,
    transport: Arc<dyn SoapTransport>,
    tickets: Arc<dyn TicketProvider>,
    sequences: KeyedLock<(u32, u32)>,
}

impl WsfeClient {
    pub fn new(
        url: impl Into<String>,
        cuit: impl Into<String>,
        transport: Arc<dyn SoapTransport>,
        tickets: Arc<dyn TicketProvider>,
    ) -> Self {
        Self {
            url: url.into(),
            cuit: cuit.into(),
            transport,
            tickets,
            sequences: KeyedLock::new(),
        }
    }

    /// FEDummy health check; needs no ticket.
    pub async fn dummy(&self) -> EinvResult<ServerStatus> {
        let body = self
            .transport
            .post(&self.url, &soap_action("FEDummy"), dummy_envelope())
            .await?;
        parse_dummy(&body)
    }

    pub async fn last_authorized(&self, sales_point: u32, voucher_type: u32) -> EinvResult<u64> {
        let ticket = self.tickets.ticket(WSFE_SERVICE).await?;
        let auth = Auth {
            ticket: &ticket,
            cuit: &self.cuit,
        };
        let body = self
            .transport
            .post(
                &self.url,
                &soap_action("FECompUltimoAutorizado"),
                last_voucher_envelope(&auth, sales_point, voucher_type),
            )
            .await?;
        let last = parse_last_voucher(&body)?;
        tracing::debug!(sales_point, voucher_type, last, "last authorized voucher");
        Ok(last)
    }

    pub async fn points_of_sale(&self) -> EinvResult<Vec<PointOfSale>> {
        let ticket = self.tickets.ticket(WSFE_SERVICE).await?;
        let auth = Auth {
            ticket: &ticket,
            cuit: &self.cuit,
        };
        let body = self
            .transport
            .post(
                &self.url,
                &soap_action("FEParamGetPtosVenta"),
                points_of_sale_envelope(&auth),
            )
            .await?;
        parse_points_of_sale(&body)
    }

    /// Authorizes `request` under the next number, serialized per sales point and voucher type.
    pub async fn authorize(&self, request: &CaeRequest) -> EinvResult<AuthorizationResult> {
        let _guard = self
            .sequences
            .lock((request.sales_point, request.voucher_type))
            .await;
        self.submit_next(request).await
    }

    /// Reads the last number and submits `request` as the next one.
    ///
    /// Takes no lock: concurrent calls for the same sales point and voucher type
    /// can compute the same number. Use [`WsfeClient::authorize`] unless the
    /// caller already serializes that pair.
    pub async fn submit_next(&self, request: &CaeRequest) -> EinvResult<AuthorizationResult> {
        let last = self
            .last_authorized(request.sales_point, request.voucher_type)
            .await?;
        let number = last + 1;
        if number > MAX_VOUCHER_NUMBER {
            return Err(EinvError::Validation(vec![format!(
                "Voucher numbering exhausted for sales point {} type {}",
                request.sales_point, request.voucher_type
            )]));
        }

        let ticket = self.tickets.ticket(WSFE_SERVICE).await?;
        let auth = Auth {
            ticket: &ticket,
            cuit: &self.cuit,
        };
        let numbered = request.numbered(number);

        tracing::info!(
            sales_point = request.sales_point,
            voucher_type = request.voucher_type,
            number,
            "submitting voucher for authorization"
        );
        let body = self
            .transport
            .post(
                &self.url,
                &soap_action("FECAESolicitar"),
                cae_request_envelope(&auth, &numbered),
            )
            .await?;

        let result = parse_cae_response(&body, request.sales_point, number)?;
        if result.is_approved() {
            tracing::info!(
                number = %result.assigned_number,
                cae = ?result.cae,
                observations = result.observations.len(),
                "voucher authorized"
            );
        } else {
            tracing::warn!(
                number = %result.assigned_number,
                errors = ?result.errors,
                "voucher rejected"
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl BillingService for WsfeClient {
    async fn last_authorized(&self, sales_point: u32, voucher_type: u32) -> EinvResult<u64> {
        WsfeClient::last_authorized(self, sales_point, voucher_type).await
    }

    async fn authorize(&self, request: &CaeRequest) -> EinvResult<AuthorizationResult> {
        WsfeClient::authorize(self, request).await
    }
}
