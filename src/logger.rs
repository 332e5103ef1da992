//! Transaction logging.
//!
//! Requests and replies are logged as XML. Outside demo mode, card and
//! credential fields are masked before anything reaches the log.

use crate::error::{Result, SoapClientError};
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use tracing::{error, info};

/// Target used for transaction log records.
pub const LOG_TARGET: &str = "payment_soap_client::transaction";

/// Logged instead of a payload that could not be masked.
pub const UNMASKABLE_PLACEHOLDER: &str = "[payload omitted: masking failed]";

/// Elements whose text content never appears in non-demo logs.
const SENSITIVE_FIELDS: &[&str] = &[
    "accountNumber",
    "cvNumber",
    "expirationMonth",
    "expirationYear",
    "routingNumber",
    "password",
    "Password",
];

/// Digits of an account number kept visible.
const VISIBLE_ACCOUNT_DIGITS: usize = 4;

/// Receives the request and reply of each dispatched transaction.
pub trait TransactionLogger: Send + Sync {
    fn log_request(&self, request_xml: &str, demo: bool);
    fn log_reply(&self, reply_xml: &str, demo: bool);
    fn log_exception(&self, error: &SoapClientError);
}

/// Logger writing to `tracing` under [`LOG_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TransactionLogger for TracingLogger {
    fn log_request(&self, request_xml: &str, demo: bool) {
        info!(target: LOG_TARGET, demo, request = %loggable(request_xml, demo), "Request");
    }

    fn log_reply(&self, reply_xml: &str, demo: bool) {
        info!(target: LOG_TARGET, demo, reply = %loggable(reply_xml, demo), "Reply");
    }

    fn log_exception(&self, error: &SoapClientError) {
        error!(
            target: LOG_TARGET,
            error = %error,
            timeout = error.is_timeout(),
            "Transaction failed"
        );
    }
}

/// Payload as it may be logged: verbatim in demo mode, masked otherwise.
pub fn loggable(xml: &str, demo: bool) -> Cow<'_, str> {
    if demo {
        return Cow::Borrowed(xml);
    }
    match mask_sensitive_fields(xml) {
        Ok(masked) => Cow::Owned(masked),
        Err(_) => Cow::Borrowed(UNMASKABLE_PLACEHOLDER),
    }
}

/// Replace the text of sensitive elements with `x` characters.
///
/// Account numbers keep their last four digits.
pub fn mask_sensitive_fields(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut current: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                current = SENSITIVE_FIELDS.contains(&name.as_str()).then_some(name);
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                current = None;
                writer.write_event(Event::End(e))?;
            }
            Event::Text(e) if current.is_some() => {
                let raw = e.unescape()?;
                let field = current.as_deref().unwrap_or_default();
                writer.write_event(Event::Text(BytesText::new(&mask_value(field, &raw))))?;
            }
            Event::CData(_) if current.is_some() => {
                writer.write_event(Event::Text(BytesText::new("xxxx")))?;
            }
            event => writer.write_event(event)?,
        }
    }

    String::from_utf8(writer.into_inner())
        .map_err(|e| SoapClientError::XmlParse(e.to_string()))
}

fn mask_value(field: &str, value: &str) -> String {
    let chars: Vec<char> = value.trim().chars().collect();
    let visible = if field == "accountNumber" && chars.len() > VISIBLE_ACCOUNT_DIGITS {
        VISIBLE_ACCOUNT_DIGITS
    } else {
        0
    };

    let hidden = chars.len() - visible;
    let mut masked = "x".repeat(hidden);
    masked.extend(&chars[hidden..]);
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "<requestMessage><merchantID>acme_01</merchantID>\
        <card><accountNumber>4111111111111111</accountNumber>\
        <expirationMonth>12</expirationMonth><expirationYear>2030</expirationYear>\
        <cvNumber>123</cvNumber></card></requestMessage>";

    #[test]
    fn test_masks_card_fields() {
        let masked = mask_sensitive_fields(REQUEST).unwrap();

        assert!(masked.contains("<accountNumber>xxxxxxxxxxxx1111</accountNumber>"));
        assert!(masked.contains("<expirationMonth>xx</expirationMonth>"));
        assert!(masked.contains("<expirationYear>xxxx</expirationYear>"));
        assert!(masked.contains("<cvNumber>xxx</cvNumber>"));
        assert!(masked.contains("<merchantID>acme_01</merchantID>"));
        assert!(!masked.contains("4111111111111111"));
    }

    #[test]
    fn test_masks_password_in_any_namespace() {
        let xml = r#"<wsse:UsernameToken xmlns:wsse="urn:x"><wsse:Username>acme_01</wsse:Username><wsse:Password>s3cret</wsse:Password></wsse:UsernameToken>"#;
        let masked = mask_sensitive_fields(xml).unwrap();

        assert!(masked.contains("<wsse:Password>xxxxxx</wsse:Password>"));
        assert!(masked.contains("<wsse:Username>acme_01</wsse:Username>"));
    }

    #[test]
    fn test_short_account_number_fully_masked() {
        let masked = mask_sensitive_fields("<accountNumber>1234</accountNumber>").unwrap();
        assert_eq!(masked, "<accountNumber>xxxx</accountNumber>");
    }

    #[test]
    fn test_demo_mode_logs_verbatim() {
        assert_eq!(loggable(REQUEST, true), REQUEST);
        assert_ne!(loggable(REQUEST, false), REQUEST);
    }

    #[test]
    fn test_unmaskable_payload_is_withheld() {
        let broken = "<card><accountNumber>4111111111111111</card>";
        assert_eq!(loggable(broken, false), UNMASKABLE_PLACEHOLDER);
    }
}
