//! Secured SOAP channel.
//!
//! A channel is bound to one endpoint for one transaction. It is opened by a
//! [`ChannelFactory`], used once, then closed or aborted. The HTTP client
//! underneath is shared per TLS setup, so its connection pool is not.

use crate::config::{
    CertificateValidation, ClientConfig, SecurityHeaderPolicy, TlsVersion, TransportConfig,
};
use crate::envelope::{build_request_envelope, MessageEncoder, UsernameToken};
use crate::error::{Result, SoapClientError};
use crate::message::{ReplyMessage, RequestMessage};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// SOAPAction of the transaction operation.
pub const SOAP_ACTION: &str = "runTransaction";

static TRANSPORT_DEFAULTS: OnceLock<TransportConfig> = OnceLock::new();

/// Install process-wide transport settings.
///
/// Call once at startup. Returns `false` if defaults were already installed,
/// in which case `config` is ignored.
pub fn install_transport_defaults(config: TransportConfig) -> bool {
    TRANSPORT_DEFAULTS.set(config).is_ok()
}

/// Installed transport settings, or the defaults when none were installed.
pub fn transport_defaults() -> TransportConfig {
    TRANSPORT_DEFAULTS.get().copied().unwrap_or_default()
}

/// Protection requested from the channel.
///
/// The HTTPS transport has no message-level encryption. `EncryptAndSign`
/// instead pins TLS trust to the service certificate: built-in roots are
/// disabled, so the endpoint must present that certificate or one issued by
/// it. A CA-issued endpoint certificate fails the handshake under this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionLevel {
    Sign,
    EncryptAndSign,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opened,
    Closed,
    Aborted,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }
}

/// Everything needed to open a channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Endpoint the channel is bound to
    pub endpoint: Url,
    /// Merchant presented to the service
    pub merchant_id: String,
    /// Identity value the service is expected to accept (effective password)
    pub expected_identity: Option<String>,
    pub protection_level: ProtectionLevel,
    pub client_certificate: Option<PathBuf>,
    pub service_certificate: Option<PathBuf>,
    pub certificate_validation: CertificateValidation,
    pub send_timeout: Duration,
    pub service_namespace: String,
    pub security_header: SecurityHeaderPolicy,
}

impl ChannelSettings {
    /// Derive channel settings from a resolved configuration.
    ///
    /// Protection is sign-only unless a service certificate is configured
    /// and sign-and-encrypt was asked for.
    pub fn from_config(config: &ClientConfig, merchant_id: &str) -> Result<Self> {
        let protection_level =
            if config.service_certificate.is_some() && config.use_signed_and_encrypted {
                ProtectionLevel::EncryptAndSign
            } else {
                ProtectionLevel::Sign
            };

        Ok(Self {
            endpoint: config.effective_server_url()?,
            merchant_id: merchant_id.to_string(),
            expected_identity: config.effective_password().map(String::from),
            protection_level,
            client_certificate: config.client_certificate.clone(),
            service_certificate: config.service_certificate.clone(),
            certificate_validation: config.certificate_validation,
            send_timeout: config.send_timeout(),
            service_namespace: config.service_namespace.clone(),
            security_header: config.security_header.clone(),
        })
    }
}

/// The remote transaction contract bound to an open channel.
#[async_trait]
pub trait TransactionProcessor: Send {
    /// Send `request` and wait for the reply. One attempt, no retry.
    async fn run_transaction(&mut self, request: &RequestMessage) -> Result<ReplyMessage>;

    /// Hard stop. Discards in-flight state; a later `close` is a no-op.
    fn abort(&mut self);

    /// Graceful close. Idempotent.
    fn close(&mut self);

    fn state(&self) -> ChannelState;
}

/// Opens channels for the dispatcher.
pub trait ChannelFactory: Send + Sync {
    type Channel: TransactionProcessor;

    fn create_channel(&self, settings: &ChannelSettings) -> Result<Self::Channel>;
}

/// Factory for HTTPS SOAP channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpChannelFactory;

impl ChannelFactory for HttpChannelFactory {
    type Channel = HttpSoapChannel;

    fn create_channel(&self, settings: &ChannelSettings) -> Result<HttpSoapChannel> {
        HttpSoapChannel::open(settings)
    }
}

/// TLS material a pooled HTTP client is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    client_certificate: Option<PathBuf>,
    service_certificate: Option<PathBuf>,
    certificate_validation: CertificateValidation,
    protection_level: ProtectionLevel,
}

impl From<&ChannelSettings> for ClientKey {
    fn from(settings: &ChannelSettings) -> Self {
        Self {
            client_certificate: settings.client_certificate.clone(),
            service_certificate: settings.service_certificate.clone(),
            certificate_validation: settings.certificate_validation,
            protection_level: settings.protection_level,
        }
    }
}

/// Process-wide HTTP clients, one per distinct TLS setup.
///
/// Channels borrow a client from here, so connection pools and TLS sessions
/// outlive a single transaction and the transport connection limit applies
/// across dispatches. Certificate files are read when a client is first
/// built; later changes to them need a restart.
static CLIENTS: OnceLock<Mutex<HashMap<ClientKey, Arc<reqwest::Client>>>> = OnceLock::new();

fn shared_client(settings: &ChannelSettings) -> Result<Arc<reqwest::Client>> {
    let key = ClientKey::from(settings);
    let mut clients = CLIENTS
        .get_or_init(Default::default)
        .lock()
        .map_err(|_| SoapClientError::ChannelConstruction("HTTP client cache poisoned".to_string()))?;

    if let Some(client) = clients.get(&key) {
        return Ok(client.clone());
    }

    let client = Arc::new(build_client(settings)?);
    debug!(
        protection_level = ?key.protection_level,
        certificate_validation = ?key.certificate_validation,
        cached_clients = clients.len() + 1,
        "Built HTTP client"
    );
    clients.insert(key, client.clone());
    Ok(client)
}

fn build_client(settings: &ChannelSettings) -> Result<reqwest::Client> {
    let defaults = transport_defaults();
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .min_tls_version(tls_version(defaults.min_tls_version))
        .pool_max_idle_per_host(defaults.connection_limit)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(ref path) = settings.client_certificate {
        builder = builder.identity(load_identity(path)?);
    }

    if let Some(ref path) = settings.service_certificate {
        let certificate = load_certificate(path)?;
        if settings.protection_level == ProtectionLevel::EncryptAndSign {
            // Only the service certificate is trusted.
            builder = builder.tls_built_in_root_certs(false);
        }
        builder = builder.add_root_certificate(certificate);
    }

    if settings.certificate_validation == CertificateValidation::AcceptAnyChain {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| SoapClientError::ChannelConstruction(e.to_string()))
}

/// SOAP 1.1 over HTTPS, built on reqwest with rustls.
#[derive(Debug)]
pub struct HttpSoapChannel {
    client: Option<Arc<reqwest::Client>>,
    endpoint: Url,
    send_timeout: Duration,
    encoder: MessageEncoder,
    credentials: Option<UsernameToken>,
    service_namespace: String,
    state: ChannelState,
}

impl HttpSoapChannel {
    /// Open a channel for `settings` on the shared client for its TLS setup.
    pub fn open(settings: &ChannelSettings) -> Result<Self> {
        validate_endpoint(&settings.endpoint)?;

        let client = shared_client(settings)?;

        if settings.certificate_validation == CertificateValidation::AcceptAnyChain {
            warn!(
                endpoint = %settings.endpoint,
                "Server certificate chain validation disabled (certificate_validation=accept_any_chain)"
            );
        }

        let credentials = settings.expected_identity.as_ref().map(|password| UsernameToken {
            username: settings.merchant_id.clone(),
            password: password.clone(),
        });

        debug!(
            endpoint = %settings.endpoint,
            protection_level = ?settings.protection_level,
            timeout_secs = settings.send_timeout.as_secs(),
            "Channel opened"
        );

        Ok(Self {
            client: Some(client),
            endpoint: settings.endpoint.clone(),
            send_timeout: settings.send_timeout,
            encoder: MessageEncoder::new(settings.security_header.clone()),
            credentials,
            service_namespace: settings.service_namespace.clone(),
            state: ChannelState::Opened,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Map an HTTP response to a reply.
    ///
    /// A SOAP fault becomes [`SoapClientError::Fault`] whatever the status.
    /// Any other non-success status becomes [`SoapClientError::HttpStatus`].
    fn decode_response(&self, status: StatusCode, bytes: &[u8]) -> Result<ReplyMessage> {
        let message = match self.encoder.read_message(bytes, usize::MAX) {
            Ok(message) => message,
            Err(_) if !status.is_success() => {
                return Err(SoapClientError::HttpStatus(status.as_u16()));
            }
            Err(e) => return Err(e),
        };

        if !status.is_success() {
            // SOAP 1.1 faults arrive with HTTP 500.
            return match message.into_payload::<ReplyMessage>() {
                Err(fault @ SoapClientError::Fault { .. }) => Err(fault),
                _ => Err(SoapClientError::HttpStatus(status.as_u16())),
            };
        }

        message.into_payload()
    }
}

#[async_trait]
impl TransactionProcessor for HttpSoapChannel {
    async fn run_transaction(&mut self, request: &RequestMessage) -> Result<ReplyMessage> {
        let client = match (self.state, self.client.as_ref()) {
            (ChannelState::Opened, Some(client)) => client.clone(),
            _ => return Err(SoapClientError::ChannelState(self.state.as_str())),
        };

        let envelope =
            build_request_envelope(request, &self.service_namespace, self.credentials.as_ref())?;
        let mut body = Vec::new();
        self.encoder.write_message_at(&envelope, &mut body, 0)?;

        debug!(endpoint = %self.endpoint, bytes = body.len(), "Sending SOAP request");

        let response = client
            .post(self.endpoint.clone())
            .timeout(self.send_timeout)
            .header(reqwest::header::CONTENT_TYPE, self.encoder.content_type())
            .header("SOAPAction", format!("\"{SOAP_ACTION}\""))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        debug!(status = status.as_u16(), bytes = bytes.len(), "Received SOAP response");

        self.decode_response(status, &bytes)
    }

    fn abort(&mut self) {
        self.client = None;
        self.state = ChannelState::Aborted;
    }

    fn close(&mut self) {
        if self.state == ChannelState::Opened {
            self.client = None;
            self.state = ChannelState::Closed;
        }
    }

    fn state(&self) -> ChannelState {
        self.state
    }
}

fn validate_endpoint(url: &Url) -> Result<()> {
    if url.scheme() != "https" {
        return Err(SoapClientError::ChannelConstruction(format!(
            "Only HTTPS endpoints are allowed: {url}"
        )));
    }
    if url.host_str().is_none() {
        return Err(SoapClientError::ChannelConstruction(format!(
            "Endpoint has no host: {url}"
        )));
    }
    Ok(())
}

fn tls_version(version: TlsVersion) -> reqwest::tls::Version {
    match version {
        TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
        TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
    }
}

/// Load a PEM file holding the client certificate chain and private key.
fn load_identity(path: &Path) -> Result<reqwest::Identity> {
    let pem = std::fs::read(path).map_err(|e| {
        SoapClientError::Certificate(format!(
            "Failed to read client certificate {}: {e}",
            path.display()
        ))
    })?;
    reqwest::Identity::from_pem(&pem).map_err(|e| {
        SoapClientError::Certificate(format!(
            "Invalid client certificate {}: {e}",
            path.display()
        ))
    })
}

fn load_certificate(path: &Path) -> Result<reqwest::Certificate> {
    let pem = std::fs::read(path).map_err(|e| {
        SoapClientError::Certificate(format!(
            "Failed to read service certificate {}: {e}",
            path.display()
        ))
    })?;
    reqwest::Certificate::from_pem(&pem).map_err(|e| {
        SoapClientError::Certificate(format!(
            "Invalid service certificate {}: {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_for(url: &str) -> ChannelSettings {
        let mut config = ClientConfig::new("acme_01");
        config.server_url = Some(Url::parse(url).unwrap());
        config.timeout = 5;
        ChannelSettings::from_config(&config, "acme_01").unwrap()
    }

    #[test]
    fn test_settings_default_to_sign_only() {
        let mut config = ClientConfig::new("acme_01");
        config.use_signed_and_encrypted = true;

        let settings = ChannelSettings::from_config(&config, "acme_01").unwrap();
        assert_eq!(settings.protection_level, ProtectionLevel::Sign);
        assert_eq!(settings.expected_identity.as_deref(), Some("acme_01"));
        assert_eq!(settings.send_timeout, Duration::from_secs(config.timeout));
    }

    #[test]
    fn test_settings_encrypt_with_service_certificate() {
        let mut config = ClientConfig::new("acme_01");
        config.service_certificate = Some(PathBuf::from("/etc/pay/service.pem"));
        let settings = ChannelSettings::from_config(&config, "acme_01").unwrap();
        assert_eq!(settings.protection_level, ProtectionLevel::Sign);

        config.use_signed_and_encrypted = true;
        let settings = ChannelSettings::from_config(&config, "acme_01").unwrap();
        assert_eq!(settings.protection_level, ProtectionLevel::EncryptAndSign);
    }

    #[test]
    fn test_open_rejects_plain_http() {
        let result = HttpSoapChannel::open(&settings_for("http://pay.example/txn"));
        assert!(matches!(result, Err(SoapClientError::ChannelConstruction(_))));
    }

    #[test]
    fn test_open_rejects_missing_certificate() {
        let mut settings = settings_for("https://pay.example/txn");
        settings.client_certificate = Some(PathBuf::from("/nonexistent/client.pem"));

        let result = HttpSoapChannel::open(&settings);
        assert!(matches!(result, Err(SoapClientError::Certificate(_))));
    }

    #[test]
    fn test_open_rejects_invalid_certificate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not a certificate").unwrap();

        let mut settings = settings_for("https://pay.example/txn");
        settings.client_certificate = Some(file.path().to_path_buf());

        let result = HttpSoapChannel::open(&settings);
        assert!(matches!(result, Err(SoapClientError::Certificate(_))));
    }

    #[test]
    fn test_channel_lifecycle() {
        let mut channel = HttpSoapChannel::open(&settings_for("https://pay.example/txn")).unwrap();
        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(channel.endpoint().as_str(), "https://pay.example/txn");

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_close_after_abort_is_noop() {
        let mut channel = HttpSoapChannel::open(&settings_for("https://pay.example/txn")).unwrap();
        channel.abort();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Aborted);
    }

    #[test]
    fn test_accept_any_chain_builds() {
        let mut settings = settings_for("https://pay.example/txn");
        settings.certificate_validation = CertificateValidation::AcceptAnyChain;
        assert!(HttpSoapChannel::open(&settings).is_ok());
    }

    #[tokio::test]
    async fn test_run_on_closed_channel_fails() {
        let mut channel = HttpSoapChannel::open(&settings_for("https://pay.example/txn")).unwrap();
        channel.close();

        let result = channel.run_transaction(&RequestMessage::default()).await;
        assert!(matches!(result, Err(SoapClientError::ChannelState("closed"))));
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let mut channel = HttpSoapChannel::open(&settings_for("https://127.0.0.1:1/txn")).unwrap();

        let result = channel.run_transaction(&RequestMessage::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(err, SoapClientError::Http(_)));
        assert!(!err.is_validation());
    }

    const FAULT: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Client</faultcode><faultstring>Invalid merchant</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;

    const ACCEPTED: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Header><wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"><wsse:BinarySecurityToken>MIIB</wsse:BinarySecurityToken></wsse:Security></soap:Header><soap:Body><c:replyMessage xmlns:c="urn:schemas-cybersource-com:transaction-data-1.211"><c:decision>ACCEPT</c:decision><c:reasonCode>100</c:reasonCode></c:replyMessage></soap:Body></soap:Envelope>"#;

    const NOT_A_FAULT: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><status>maintenance</status></soap:Body></soap:Envelope>"#;

    fn open_channel() -> HttpSoapChannel {
        HttpSoapChannel::open(&settings_for("https://pay.example/txn")).unwrap()
    }

    #[test]
    fn test_channels_share_client_per_tls_setup() {
        let settings = settings_for("https://pay.example/txn");
        let first = HttpSoapChannel::open(&settings).unwrap();
        let second = HttpSoapChannel::open(&settings_for("https://other.example/txn")).unwrap();

        let a = first.client.as_ref().unwrap();
        let b = second.client.as_ref().unwrap();
        assert!(Arc::ptr_eq(a, b));

        let mut relaxed = settings.clone();
        relaxed.certificate_validation = CertificateValidation::AcceptAnyChain;
        let third = HttpSoapChannel::open(&relaxed).unwrap();
        assert!(!Arc::ptr_eq(a, third.client.as_ref().unwrap()));
    }

    #[test]
    fn test_shared_client_survives_channel_close() {
        let settings = settings_for("https://pay.example/txn");
        let mut first = HttpSoapChannel::open(&settings).unwrap();
        let pooled = first.client.clone().unwrap();
        first.close();

        let second = HttpSoapChannel::open(&settings).unwrap();
        assert!(Arc::ptr_eq(&pooled, second.client.as_ref().unwrap()));
    }

    #[test]
    fn test_protection_level_selects_distinct_client() {
        let mut settings = settings_for("https://pay.example/txn");
        settings.service_certificate = Some(PathBuf::from("/etc/pay/service.pem"));
        let signed = ClientKey::from(&settings);

        settings.protection_level = ProtectionLevel::EncryptAndSign;
        let pinned = ClientKey::from(&settings);

        assert_ne!(signed, pinned);
    }

    #[test]
    fn test_decode_success_reply() {
        let reply = open_channel()
            .decode_response(StatusCode::OK, ACCEPTED.as_bytes())
            .unwrap();
        assert!(reply.is_accepted());
        assert_eq!(reply.reason_code, Some(100));
    }

    #[test]
    fn test_decode_fault_on_server_error() {
        let err = open_channel()
            .decode_response(StatusCode::INTERNAL_SERVER_ERROR, FAULT.as_bytes())
            .unwrap_err();
        assert!(matches!(err, SoapClientError::Fault { ref code, .. } if code == "soap:Client"));
    }

    #[test]
    fn test_decode_fault_on_success_status() {
        let err = open_channel()
            .decode_response(StatusCode::OK, FAULT.as_bytes())
            .unwrap_err();
        assert!(matches!(err, SoapClientError::Fault { ref message, .. } if message == "Invalid merchant"));
    }

    #[test]
    fn test_decode_non_xml_error_body() {
        let err = open_channel()
            .decode_response(StatusCode::BAD_GATEWAY, b"<html>Bad Gateway")
            .unwrap_err();
        assert!(matches!(err, SoapClientError::HttpStatus(502)));
    }

    #[test]
    fn test_decode_error_status_without_fault() {
        let err = open_channel()
            .decode_response(StatusCode::SERVICE_UNAVAILABLE, NOT_A_FAULT.as_bytes())
            .unwrap_err();
        assert!(matches!(err, SoapClientError::HttpStatus(503)));
    }

    #[test]
    fn test_decode_malformed_success_body() {
        let err = open_channel()
            .decode_response(StatusCode::OK, b"not xml at all")
            .unwrap_err();
        assert!(matches!(err, SoapClientError::XmlParse(_)));
    }

    #[test]
    fn test_install_transport_defaults_once() {
        install_transport_defaults(TransportConfig::default());
        let second = install_transport_defaults(TransportConfig {
            connection_limit: 99,
            min_tls_version: TlsVersion::Tls13,
        });

        assert!(!second);
        assert_ne!(transport_defaults().connection_limit, 99);
    }
}
