//! SOAP client for a payment transaction service
//!
//! Sends a transaction request over a secured SOAP channel and returns the
//! service's reply.
//!
//! # Features
//!
//! - Per-merchant configuration from a YAML settings file
//! - HTTPS transport with client certificates and a pinned service certificate
//! - WS-Security UsernameToken on outbound requests
//! - Removal of the WS-Security header from responses before deserialization
//! - Masked request/reply logging outside demo mode
//! - SOAP Fault mapping to typed errors
//!
//! # Example
//!
//! ```ignore
//! use payment_soap_client::{ClientSettings, RequestMessage, SoapClient};
//!
//! let settings = ClientSettings::load("payment-soap-client.yaml")?;
//! let client = SoapClient::new(settings);
//!
//! let mut request = RequestMessage::default();
//! let reply = client.run_transaction_default(&mut request).await?;
//! println!("{:?}", reply.decision);
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logger;
pub mod message;

pub use channel::{
    install_transport_defaults, ChannelFactory, ChannelSettings, ChannelState,
    HttpChannelFactory, TransactionProcessor,
};
pub use client::SoapClient;
pub use config::{ClientConfig, ClientSettings};
pub use envelope::MessageEncoder;
pub use error::{Result, SoapClientError};
pub use logger::{TracingLogger, TransactionLogger};
pub use message::{ReplyMessage, RequestMessage};
