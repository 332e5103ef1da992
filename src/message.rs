//! Typed transaction payloads exchanged with the service.
//!
//! Field order follows the service schema, which is sequence-ordered, so the
//! struct order is the order elements are written on the wire.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Root element of a serialized request.
pub const REQUEST_ROOT: &str = "requestMessage";

/// Root element of a serialized reply.
pub const REPLY_ROOT: &str = "replyMessage";

/// Client library name reported to the service.
pub const CLIENT_LIBRARY: &str = "Rust Soap";

/// Client library version reported to the service.
pub const CLIENT_LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// TLS stack reported as the security library.
pub const CLIENT_SECURITY_LIBRARY_VERSION: &str = "rustls 0.21";

/// Payment transaction request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestMessage {
    #[serde(rename = "merchantID", skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_reference_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_library: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_library_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_environment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_security_library_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_to: Option<BillTo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_totals: Option<PurchaseTotals>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc_auth_service: Option<ServiceRequest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc_capture_service: Option<CaptureService>,
}

impl RequestMessage {
    /// Overwrite the client metadata fields.
    pub fn stamp_client_metadata(&mut self) {
        self.client_library = Some(CLIENT_LIBRARY.to_string());
        self.client_library_version = Some(CLIENT_LIBRARY_VERSION.to_string());
        self.client_environment = Some(client_environment());
        self.client_security_library_version = Some(CLIENT_SECURITY_LIBRARY_VERSION.to_string());
    }
}

/// Environment descriptor reported to the service.
pub fn client_environment() -> String {
    format!(
        "{}/{}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::env::consts::FAMILY
    )
}

/// Billing address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BillTo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Currency and amount. Amounts stay decimal strings as the service sends them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PurchaseTotals {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grand_total_amount: Option<String>,
}

/// Payment card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Card {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_type: Option<String>,
}

/// A service request toggled by its `run` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(rename = "@run", alias = "run")]
    pub run: bool,
}

impl Default for ServiceRequest {
    fn default() -> Self {
        Self { run: true }
    }
}

/// Capture of a previous authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureService {
    #[serde(rename = "@run", alias = "run")]
    pub run: bool,

    #[serde(rename = "authRequestID", alias = "auth_request_id")]
    pub auth_request_id: String,
}

/// Transaction reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplyMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_reference_code: Option<String>,

    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u32>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_field: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_field: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_totals: Option<PurchaseTotals>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc_auth_reply: Option<CcAuthReply>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc_capture_reply: Option<CcCaptureReply>,
}

impl ReplyMessage {
    pub fn is_accepted(&self) -> bool {
        self.decision.as_deref() == Some("ACCEPT")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CcAuthReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avs_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CcCaptureReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_id: Option<String>,
}

/// Serialize `value` under `root` for logging.
///
/// Serialization failures are swallowed; they must never fail a transaction.
pub fn to_loggable_xml<T: Serialize>(value: &T, root: &str) -> Option<String> {
    match quick_xml::se::to_string_with_root(root, value) {
        Ok(xml) => Some(xml),
        Err(e) => {
            debug!(root = root, error = %e, "Could not serialize payload for logging");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestMessage {
        RequestMessage {
            merchant_reference_code: Some("ORDER-1".to_string()),
            purchase_totals: Some(PurchaseTotals {
                currency: Some("USD".to_string()),
                grand_total_amount: Some("10.00".to_string()),
            }),
            card: Some(Card {
                account_number: Some("4111111111111111".to_string()),
                expiration_month: Some("12".to_string()),
                expiration_year: Some("2030".to_string()),
                ..Default::default()
            }),
            cc_auth_service: Some(ServiceRequest::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_stamp_client_metadata_overwrites() {
        let mut request = RequestMessage {
            client_library: Some("something else".to_string()),
            ..Default::default()
        };
        request.stamp_client_metadata();

        assert_eq!(request.client_library.as_deref(), Some(CLIENT_LIBRARY));
        assert_eq!(
            request.client_library_version.as_deref(),
            Some(CLIENT_LIBRARY_VERSION)
        );
        assert_eq!(request.client_environment, Some(client_environment()));
        assert_eq!(
            request.client_security_library_version.as_deref(),
            Some(CLIENT_SECURITY_LIBRARY_VERSION)
        );
    }

    #[test]
    fn test_request_xml_shape() {
        let xml = to_loggable_xml(&sample_request(), REQUEST_ROOT).unwrap();
        assert!(xml.starts_with("<requestMessage>"));
        assert!(xml.contains("<merchantReferenceCode>ORDER-1</merchantReferenceCode>"));
        assert!(xml.contains("<grandTotalAmount>10.00</grandTotalAmount>"));
        assert!(xml.contains(r#"<ccAuthService run="true"/>"#));
        assert!(!xml.contains("merchantID"));

        let merchant_pos = xml.find("<merchantReferenceCode>").unwrap();
        let card_pos = xml.find("<card>").unwrap();
        let totals_pos = xml.find("<purchaseTotals>").unwrap();
        assert!(merchant_pos < totals_pos && totals_pos < card_pos);
    }

    #[test]
    fn test_reply_from_xml() {
        let xml = r#"<replyMessage>
  <merchantReferenceCode>ORDER-1</merchantReferenceCode>
  <requestID>6543210987654321</requestID>
  <decision>REJECT</decision>
  <reasonCode>101</reasonCode>
  <missingField>c:billTo/c:city</missingField>
  <missingField>c:billTo/c:country</missingField>
  <ccAuthReply>
    <reasonCode>101</reasonCode>
  </ccAuthReply>
</replyMessage>"#;
        let reply: ReplyMessage = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("6543210987654321"));
        assert_eq!(reply.reason_code, Some(101));
        assert_eq!(reply.missing_field.len(), 2);
        assert!(!reply.is_accepted());
        assert_eq!(reply.cc_auth_reply.unwrap().reason_code, Some(101));
    }

    #[test]
    fn test_request_from_yaml() {
        let yaml = r#"
merchantReferenceCode: ORDER-9
purchaseTotals:
  currency: EUR
  grandTotalAmount: "5.00"
ccAuthService:
  run: true
"#;
        let request: RequestMessage = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(request.merchant_reference_code.as_deref(), Some("ORDER-9"));
        assert!(request.merchant_id.is_none());
        assert_eq!(request.cc_auth_service, Some(ServiceRequest { run: true }));
    }
}
