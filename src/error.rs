//! Error types for the payment SOAP client.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SoapClientError>;

/// Errors surfaced by a transaction dispatch.
///
/// Nothing is retried internally. Every variant crosses the library boundary
/// unchanged so callers can apply their own retry policy.
#[derive(Error, Debug)]
pub enum SoapClientError {
    /// Neither the request nor the configuration carried a merchant ID.
    #[error("Missing merchant ID: set it on the request or in the configuration")]
    MissingMerchantId,

    /// No merchant was named, so no configuration could be built.
    #[error("No configuration found: no merchant named on the request or in the settings")]
    NoConfiguration,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Channel construction failed: {0}")]
    ChannelConstruction(String),

    #[error("Channel is {0} and cannot be used")]
    ChannelState(&'static str),

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("XXE attack detected: {0}")]
    XxeDetected(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The service answered with a SOAP fault.
    #[error("SOAP fault {code}: {message}")]
    Fault { code: String, message: String },

    /// Non-success HTTP status without a SOAP fault body.
    #[error("Service returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoapClientError {
    /// Whether the failure happened before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingMerchantId | Self::NoConfiguration | Self::Config(_)
        )
    }

    /// Whether the transport gave up because the send timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}

impl From<quick_xml::Error> for SoapClientError {
    fn from(e: quick_xml::Error) -> Self {
        Self::XmlParse(e.to_string())
    }
}

impl From<quick_xml::de::DeError> for SoapClientError {
    fn from(e: quick_xml::de::DeError) -> Self {
        Self::Serialization(e.to_string())
    }
}
