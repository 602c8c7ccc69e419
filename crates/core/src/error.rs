use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EinvError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("{}", transient_message(.message, .outcome_unknown))]
    TransientNetwork {
        message: String,
        /// The request may have reached the authority before the failure.
        outcome_unknown: bool,
    },

    #[error("Authority fault {code}: {message}")]
    AuthorityFault { code: String, message: String },

    #[error(
        "The authority already issued a valid ticket for service '{service}'; \
         inspect or clear the ticket cache instead of requesting a new one"
    )]
    DuplicateTicket { service: String },

    #[error("Invoice failed validation: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invoice {number} rejected by the authority: {}", .errors.join("; "))]
    Rejection { number: String, errors: Vec<String> },

    #[error("Malformed authority response: {0}")]
    MalformedResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invoice already authorized: {0}")]
    AlreadyAuthorized(String),

    #[error(
        "Invoice {invoice_id} was authorized as {number} with CAE {cae} but could not be \
         recorded ({message}); do not resubmit, record the CAE manually"
    )]
    UnrecordedAuthorization {
        invoice_id: String,
        number: String,
        cae: String,
        message: String,
    },
}

fn transient_message(message: &str, outcome_unknown: &bool) -> String {
    if *outcome_unknown {
        format!(
            "Transient network error: {message} (outcome unknown: verify with the \
             last-voucher query before retrying)"
        )
    } else {
        format!("Transient network error: {message}")
    }
}

impl EinvError {
    pub fn transient(message: impl Into<String>) -> Self {
        EinvError::TransientNetwork {
            message: message.into(),
            outcome_unknown: false,
        }
    }

    /// Only transient network failures are safe to retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EinvError::TransientNetwork { .. })
    }

    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            EinvError::TransientNetwork {
                outcome_unknown: true,
                ..
            }
        )
    }
}

impl From<std::io::Error> for EinvError {
    fn from(err: std::io::Error) -> Self {
        EinvError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EinvError {
    fn from(err: serde_json::Error) -> Self {
        EinvError::Storage(err.to_string())
    }
}

pub type EinvResult<T> = Result<T, EinvError>;
