//! Configuration types for the payment SOAP client.
//!
//! [`ClientSettings`] is the file-backed settings store. It holds top-level
//! defaults plus per-merchant overrides and produces one [`ClientConfig`] per
//! merchant through [`ClientSettings::configuration_for`].

use crate::envelope::WSSE_NS;
use crate::error::{Result, SoapClientError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Production transaction endpoint.
pub const PRODUCTION_URL: &str = "https://ics2ws.ic3.com/commerce/1.x/transactionProcessor";

/// Test transaction endpoint.
pub const TEST_URL: &str = "https://ics2wstest.ic3.com/commerce/1.x/transactionProcessor";

/// Namespace of the transaction payload elements.
pub const DEFAULT_SERVICE_NAMESPACE: &str = "urn:schemas-cybersource-com:transaction-data-1.211";

/// Default send timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 130;

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
}

/// How the server certificate chain is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateValidation {
    /// Validate the chain against trusted roots.
    #[default]
    Chain,
    /// Accept any chain and rely on the pinned service certificate and
    /// expected identity. Weakens TLS server authentication; opt-in only.
    AcceptAnyChain,
}

/// Minimum TLS protocol version negotiated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Process-wide transport settings, installed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum idle connections kept per host
    pub connection_limit: usize,

    /// Minimum TLS version
    pub min_tls_version: TlsVersion,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_limit: 10,
            min_tls_version: TlsVersion::Tls12,
        }
    }
}

/// Which `Security` header elements are stripped from responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeaderPolicy {
    /// Namespaces recognized as WS-Security. The first `Security` element in
    /// any of these is removed.
    pub namespaces: Vec<String>,

    /// Warn when a `Security` element appears in an unrecognized namespace
    pub warn_on_foreign_namespace: bool,
}

impl Default for SecurityHeaderPolicy {
    fn default() -> Self {
        Self {
            namespaces: vec![WSSE_NS.to_string()],
            warn_on_foreign_namespace: true,
        }
    }
}

impl SecurityHeaderPolicy {
    pub fn matches(&self, namespace: &[u8]) -> bool {
        self.namespaces.iter().any(|ns| ns.as_bytes() == namespace)
    }
}

/// Configuration for a single transaction dispatch.
///
/// Read-only during a dispatch. The dispatcher never writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Merchant ID
    pub merchant_id: Option<String>,

    /// Password (transaction key). Falls back to the merchant ID.
    pub password: Option<String>,

    /// Explicit endpoint, overrides `send_to_production`
    pub server_url: Option<Url>,

    /// Use the production endpoint instead of the test endpoint
    pub send_to_production: bool,

    /// Send timeout in seconds
    pub timeout: u64,

    /// Log requests, replies and errors
    pub enable_log: bool,

    /// Log payloads unmasked
    pub demo: bool,

    /// Upgrade protection to sign-and-encrypt when a service certificate is set
    pub use_signed_and_encrypted: bool,

    /// Server certificate chain validation mode
    pub certificate_validation: CertificateValidation,

    /// PEM file holding the client certificate chain and private key
    pub client_certificate: Option<PathBuf>,

    /// PEM file holding the service certificate
    pub service_certificate: Option<PathBuf>,

    /// Namespace of the transaction payload
    pub service_namespace: String,

    /// Response security header stripping policy
    pub security_header: SecurityHeaderPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            merchant_id: None,
            password: None,
            server_url: None,
            send_to_production: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            enable_log: false,
            demo: false,
            use_signed_and_encrypted: false,
            certificate_validation: CertificateValidation::Chain,
            client_certificate: None,
            service_certificate: None,
            service_namespace: DEFAULT_SERVICE_NAMESPACE.to_string(),
            security_header: SecurityHeaderPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `merchant_id` with default settings.
    pub fn new(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: Some(merchant_id.into()),
            ..Default::default()
        }
    }

    /// The configured merchant ID, or [`SoapClientError::MissingMerchantId`].
    pub fn non_null_merchant_id(&self) -> Result<&str> {
        self.merchant_id
            .as_deref()
            .ok_or(SoapClientError::MissingMerchantId)
    }

    /// Password presented to the service; the merchant ID when unset.
    pub fn effective_password(&self) -> Option<&str> {
        self.password.as_deref().or(self.merchant_id.as_deref())
    }

    /// Endpoint the channel is bound to.
    pub fn effective_server_url(&self) -> Result<Url> {
        if let Some(ref url) = self.server_url {
            return Ok(url.clone());
        }

        let url = if self.send_to_production {
            PRODUCTION_URL
        } else {
            TEST_URL
        };
        Url::parse(url).map_err(|e| SoapClientError::Config(format!("Invalid server URL: {e}")))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Per-merchant overrides. Unset fields inherit the top-level value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MerchantOverrides {
    pub password: Option<String>,
    pub server_url: Option<Url>,
    pub send_to_production: Option<bool>,
    pub timeout: Option<u64>,
    pub enable_log: Option<bool>,
    pub demo: Option<bool>,
    pub use_signed_and_encrypted: Option<bool>,
    pub certificate_validation: Option<CertificateValidation>,
    pub client_certificate: Option<PathBuf>,
    pub service_certificate: Option<PathBuf>,
}

/// File-backed settings store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Default merchant, used when a request carries none
    pub merchant_id: Option<String>,

    /// Defaults shared by every merchant
    #[serde(flatten)]
    pub defaults: MerchantOverrides,

    /// Namespace of the transaction payload
    pub service_namespace: String,

    /// Process-wide transport settings
    pub transport: TransportConfig,

    /// Response security header stripping policy
    pub security_header: SecurityHeaderPolicy,

    /// Merchant-specific overrides keyed by merchant ID
    pub merchants: HashMap<String, MerchantOverrides>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            merchant_id: None,
            defaults: MerchantOverrides::default(),
            service_namespace: DEFAULT_SERVICE_NAMESPACE.to_string(),
            transport: TransportConfig::default(),
            security_header: SecurityHeaderPolicy::default(),
            merchants: HashMap::new(),
        }
    }
}

impl ClientSettings {
    /// Parse settings from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| SoapClientError::Config(format!("Failed to parse settings: {e}")))
    }

    /// Read and parse a YAML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Build the configuration for `merchant_id`, falling back to the
    /// default merchant.
    ///
    /// Fails with [`SoapClientError::NoConfiguration`] when neither names a
    /// merchant.
    pub fn configuration_for(&self, merchant_id: Option<&str>) -> Result<ClientConfig> {
        let merchant_id = merchant_id
            .or(self.merchant_id.as_deref())
            .ok_or(SoapClientError::NoConfiguration)?;

        let base = &self.defaults;
        let empty = MerchantOverrides::default();
        let merchant = self.merchants.get(merchant_id).unwrap_or(&empty);
        let defaults = ClientConfig::default();

        Ok(ClientConfig {
            merchant_id: Some(merchant_id.to_string()),
            password: merchant.password.clone().or_else(|| base.password.clone()),
            server_url: merchant.server_url.clone().or_else(|| base.server_url.clone()),
            send_to_production: merchant
                .send_to_production
                .or(base.send_to_production)
                .unwrap_or(defaults.send_to_production),
            timeout: merchant.timeout.or(base.timeout).unwrap_or(defaults.timeout),
            enable_log: merchant
                .enable_log
                .or(base.enable_log)
                .unwrap_or(defaults.enable_log),
            demo: merchant.demo.or(base.demo).unwrap_or(defaults.demo),
            use_signed_and_encrypted: merchant
                .use_signed_and_encrypted
                .or(base.use_signed_and_encrypted)
                .unwrap_or(defaults.use_signed_and_encrypted),
            certificate_validation: merchant
                .certificate_validation
                .or(base.certificate_validation)
                .unwrap_or(defaults.certificate_validation),
            client_certificate: merchant
                .client_certificate
                .clone()
                .or_else(|| base.client_certificate.clone()),
            service_certificate: merchant
                .service_certificate
                .clone()
                .or_else(|| base.service_certificate.clone()),
            service_namespace: self.service_namespace.clone(),
            security_header: self.security_header.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.certificate_validation, CertificateValidation::Chain);
        assert!(!config.use_signed_and_encrypted);
        assert_eq!(config.security_header.namespaces, vec![WSSE_NS.to_string()]);
    }

    #[test]
    fn test_effective_server_url() {
        let mut config = ClientConfig::new("acme_01");
        assert_eq!(config.effective_server_url().unwrap().as_str(), TEST_URL);

        config.send_to_production = true;
        assert_eq!(config.effective_server_url().unwrap().as_str(), PRODUCTION_URL);

        config.server_url = Some(Url::parse("https://pay.example/txn").unwrap());
        assert_eq!(
            config.effective_server_url().unwrap().as_str(),
            "https://pay.example/txn"
        );
    }

    #[test]
    fn test_effective_password_falls_back_to_merchant() {
        let mut config = ClientConfig::new("acme_01");
        assert_eq!(config.effective_password(), Some("acme_01"));

        config.password = Some("secret".to_string());
        assert_eq!(config.effective_password(), Some("secret"));
    }

    #[test]
    fn test_non_null_merchant_id() {
        assert!(matches!(
            ClientConfig::default().non_null_merchant_id(),
            Err(SoapClientError::MissingMerchantId)
        ));
        assert_eq!(ClientConfig::new("m").non_null_merchant_id().unwrap(), "m");
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
merchant_id: acme_01
send_to_production: false
timeout: 30
enable_log: true
transport:
  connection_limit: 4
  min_tls_version: "1.3"
merchants:
  acme_02:
    password: key-02
    server_url: https://pay.example/txn
    timeout: 60
    certificate_validation: accept_any_chain
"#;
        let settings = ClientSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.merchant_id.as_deref(), Some("acme_01"));
        assert_eq!(settings.transport.connection_limit, 4);
        assert_eq!(settings.transport.min_tls_version, TlsVersion::Tls13);

        let default_merchant = settings.configuration_for(None).unwrap();
        assert_eq!(default_merchant.merchant_id.as_deref(), Some("acme_01"));
        assert_eq!(default_merchant.timeout, 30);
        assert!(default_merchant.enable_log);
        assert_eq!(default_merchant.effective_server_url().unwrap().as_str(), TEST_URL);

        let other = settings.configuration_for(Some("acme_02")).unwrap();
        assert_eq!(other.merchant_id.as_deref(), Some("acme_02"));
        assert_eq!(other.timeout, 60);
        assert!(other.enable_log);
        assert_eq!(other.effective_password(), Some("key-02"));
        assert_eq!(
            other.certificate_validation,
            CertificateValidation::AcceptAnyChain
        );
        assert_eq!(
            other.effective_server_url().unwrap().as_str(),
            "https://pay.example/txn"
        );
    }

    #[test]
    fn test_configuration_for_without_merchant() {
        let settings = ClientSettings::default();
        let result = settings.configuration_for(None);
        assert!(matches!(result, Err(SoapClientError::NoConfiguration)));
    }

    #[test]
    fn test_configuration_for_unknown_merchant_uses_defaults() {
        let settings = ClientSettings::default();
        let config = settings.configuration_for(Some("walk_in")).unwrap();
        assert_eq!(config.merchant_id.as_deref(), Some("walk_in"));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_policy_matches_namespace() {
        let policy = SecurityHeaderPolicy::default();
        assert!(policy.matches(WSSE_NS.as_bytes()));
        assert!(!policy.matches(b"urn:example:security"));
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::new("acme_01");
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.merchant_id, config.merchant_id);
        assert_eq!(parsed.timeout, config.timeout);
    }
}
