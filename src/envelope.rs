//! SOAP envelope encoding.
//!
//! The inbound path parses the raw response, rejects any DTD, and deletes the
//! first WS-Security `Security` element before the message is built. The
//! service may send that header unsigned, and the channel requires a present
//! security header to be signed.
//!
//! quick-xml never expands entities or fetches external resources, and
//! `DOCTYPE` declarations are refused outright, so no document can trigger
//! an external entity lookup.

use crate::config::{SecurityHeaderPolicy, SoapVersion};
use crate::error::{Result, SoapClientError};
use crate::message::{RequestMessage, REQUEST_ROOT};
use chrono::{Duration, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::{NsReader, Writer};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::Write;
use std::ops::Range;
use tracing::{debug, warn};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const WSSE_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const PASSWORD_TEXT_TYPE: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";

/// Content type of SOAP 1.1 messages.
pub const CONTENT_TYPE: &str = "text/xml; charset=utf-8";

const SECURITY: &[u8] = b"Security";

/// Lifetime of the outbound security timestamp.
const TIMESTAMP_TTL_SECS: i64 = 300;

/// An in-memory SOAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapMessage {
    version: SoapVersion,
    document: Vec<u8>,
    max_size_of_headers: usize,
    security_header_removed: bool,
}

impl SoapMessage {
    /// Wrap an already serialized SOAP 1.1 document.
    pub fn new(document: Vec<u8>) -> Self {
        Self {
            version: SoapVersion::Soap11,
            document,
            max_size_of_headers: usize::MAX,
            security_header_removed: false,
        }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.document
    }

    /// The document as text. Inbound documents are always valid UTF-8.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.document).unwrap_or_default()
    }

    /// Header size limit handed over by the caller of `read_message`.
    pub fn max_size_of_headers(&self) -> usize {
        self.max_size_of_headers
    }

    /// Whether a WS-Security header was stripped on the way in.
    pub fn security_header_removed(&self) -> bool {
        self.security_header_removed
    }

    /// Deserialize the first element of the SOAP `Body`.
    ///
    /// A SOAP fault in the body is returned as [`SoapClientError::Fault`].
    pub fn into_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = extract_body_payload(&self.document)?;
        let xml = String::from_utf8(payload.xml)
            .map_err(|e| SoapClientError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

        if payload.is_fault {
            let fault: SoapFault = quick_xml::de::from_str(&xml)?;
            return Err(SoapClientError::Fault {
                code: fault.code,
                message: fault.message,
            });
        }

        Ok(quick_xml::de::from_str(&xml)?)
    }
}

/// Credentials carried in the outbound WS-Security `UsernameToken`.
#[derive(Debug, Clone)]
pub struct UsernameToken {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct SoapFault {
    #[serde(rename = "faultcode", default)]
    code: String,
    #[serde(rename = "faultstring", default)]
    message: String,
}

/// Text message encoder with security header stripping.
#[derive(Debug, Clone, Default)]
pub struct MessageEncoder {
    policy: SecurityHeaderPolicy,
}

impl MessageEncoder {
    pub fn new(policy: SecurityHeaderPolicy) -> Self {
        Self { policy }
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn message_version(&self) -> SoapVersion {
        SoapVersion::Soap11
    }

    /// Parse an inbound document and strip the first WS-Security header.
    ///
    /// Documents without a matching header are re-emitted unchanged.
    pub fn read_message(&self, data: &[u8], max_size_of_headers: usize) -> Result<SoapMessage> {
        let xml_str = std::str::from_utf8(data)
            .map_err(|e| SoapClientError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

        let mut reader = NsReader::from_str(xml_str);
        let mut writer = Writer::new(Vec::with_capacity(data.len()));

        let mut depth = 0usize;
        let mut saw_root = false;
        let mut removed = false;
        // Nesting level inside the element being dropped; 0 when not dropping.
        let mut skip_depth = 0usize;

        let mut buf = Vec::new();

        loop {
            buf.clear();
            let (ns, event) = reader.read_resolved_event_into(&mut buf)?;

            match event {
                Event::DocType(_) => {
                    return Err(SoapClientError::XxeDetected(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ));
                }
                Event::Eof => break,
                Event::Start(_) | Event::Empty(_) if depth == 0 && saw_root => {
                    return Err(SoapClientError::XmlParse(
                        "Content after the root element".to_string(),
                    ));
                }
                Event::Text(ref text)
                    if depth == 0 && !text.iter().all(u8::is_ascii_whitespace) =>
                {
                    return Err(SoapClientError::XmlParse(
                        "Text outside the root element".to_string(),
                    ));
                }
                Event::CData(_) if depth == 0 => {
                    return Err(SoapClientError::XmlParse(
                        "CDATA outside the root element".to_string(),
                    ));
                }
                _ => {}
            }

            match &event {
                Event::Start(_) => {
                    depth += 1;
                    saw_root = true;
                }
                Event::Empty(_) => saw_root = true,
                Event::End(_) => depth = depth.saturating_sub(1),
                _ => {}
            }

            if skip_depth > 0 {
                match event {
                    Event::Start(_) => skip_depth += 1,
                    Event::End(_) => skip_depth -= 1,
                    _ => {}
                }
                continue;
            }

            let security = match &event {
                Event::Start(e) | Event::Empty(e) => e.local_name().as_ref() == SECURITY,
                _ => false,
            };

            if security {
                let namespace = match ns {
                    ResolveResult::Bound(Namespace(uri)) => Some(uri),
                    _ => None,
                };
                let recognized = namespace.is_some_and(|uri| self.policy.matches(uri));

                if recognized && !removed {
                    removed = true;
                    if matches!(event, Event::Start(_)) {
                        skip_depth = 1;
                    }
                    debug!("Removed WS-Security header from response");
                    continue;
                }

                if !recognized && self.policy.warn_on_foreign_namespace {
                    warn!(
                        namespace = %namespace.map(String::from_utf8_lossy).unwrap_or_default(),
                        "Security element in unrecognized namespace left in place"
                    );
                }
            }

            writer.write_event(event)?;
        }

        if !saw_root {
            return Err(SoapClientError::XmlParse("Document has no root element".to_string()));
        }
        if depth != 0 {
            return Err(SoapClientError::XmlParse("Unexpected end of document".to_string()));
        }

        Ok(SoapMessage {
            version: self.message_version(),
            document: writer.into_inner(),
            max_size_of_headers,
            security_header_removed: removed,
        })
    }

    /// Stream `message` into `writer` and flush.
    pub fn write_message<W: Write>(&self, message: &SoapMessage, writer: &mut W) -> Result<()> {
        writer.write_all(&message.document)?;
        writer.flush()?;
        Ok(())
    }

    /// Copy `message` into `buffer` starting at `offset`.
    ///
    /// The buffer grows to at least `offset + len`; bytes before `offset` are
    /// left untouched. Returns the range holding the message.
    pub fn write_message_at(
        &self,
        message: &SoapMessage,
        buffer: &mut Vec<u8>,
        offset: usize,
    ) -> Result<Range<usize>> {
        let mut encoded = Vec::with_capacity(message.document.len());
        self.write_message(message, &mut encoded)?;

        let end = offset.checked_add(encoded.len()).ok_or_else(|| {
            SoapClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Offset {offset} leaves no room for {} bytes", encoded.len()),
            ))
        })?;
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset..end].copy_from_slice(&encoded);

        Ok(offset..end)
    }
}

/// Build the outbound SOAP 1.1 envelope for `request`.
///
/// The payload is written unprefixed under a default namespace declared on
/// `Body`. A WS-Security header is added when `credentials` are given.
pub fn build_request_envelope(
    request: &RequestMessage,
    service_namespace: &str,
    credentials: Option<&UsernameToken>,
) -> Result<SoapMessage> {
    let payload = quick_xml::se::to_string_with_root(REQUEST_ROOT, request)?;

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(
        BytesStart::new("soapenv:Envelope").with_attributes([("xmlns:soapenv", SOAP_11_NS)]),
    ))?;

    writer.write_event(Event::Start(BytesStart::new("soapenv:Header")))?;
    if let Some(token) = credentials {
        write_security_header(&mut writer, token)?;
    }
    writer.write_event(Event::End(BytesEnd::new("soapenv:Header")))?;

    writer.write_event(Event::Start(
        BytesStart::new("soapenv:Body").with_attributes([("xmlns", service_namespace)]),
    ))?;
    writer.write_event(Event::Text(BytesText::from_escaped(payload.as_str())))?;
    writer.write_event(Event::End(BytesEnd::new("soapenv:Body")))?;

    writer.write_event(Event::End(BytesEnd::new("soapenv:Envelope")))?;

    Ok(SoapMessage::new(writer.into_inner()))
}

fn write_security_header(writer: &mut Writer<Vec<u8>>, token: &UsernameToken) -> Result<()> {
    let created = Utc::now();
    let expires = created + Duration::seconds(TIMESTAMP_TTL_SECS);

    writer.write_event(Event::Start(BytesStart::new("wsse:Security").with_attributes([
        ("xmlns:wsse", WSSE_NS),
        ("xmlns:wsu", WSU_NS),
        ("soapenv:mustUnderstand", "1"),
    ])))?;

    writer.write_event(Event::Start(BytesStart::new("wsu:Timestamp")))?;
    write_text_element(
        writer,
        "wsu:Created",
        &created.to_rfc3339_opts(SecondsFormat::Millis, true),
    )?;
    write_text_element(
        writer,
        "wsu:Expires",
        &expires.to_rfc3339_opts(SecondsFormat::Millis, true),
    )?;
    writer.write_event(Event::End(BytesEnd::new("wsu:Timestamp")))?;

    writer.write_event(Event::Start(BytesStart::new("wsse:UsernameToken")))?;
    write_text_element(writer, "wsse:Username", &token.username)?;
    writer.write_event(Event::Start(
        BytesStart::new("wsse:Password").with_attributes([("Type", PASSWORD_TEXT_TYPE)]),
    ))?;
    writer.write_event(Event::Text(BytesText::new(&token.password)))?;
    writer.write_event(Event::End(BytesEnd::new("wsse:Password")))?;
    writer.write_event(Event::End(BytesEnd::new("wsse:UsernameToken")))?;

    writer.write_event(Event::End(BytesEnd::new("wsse:Security")))?;
    Ok(())
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// First element of the SOAP `Body`, with names reduced to local names.
struct BodyPayload {
    xml: Vec<u8>,
    is_fault: bool,
}

fn extract_body_payload(document: &[u8]) -> Result<BodyPayload> {
    let mut reader = NsReader::from_reader(document);
    let mut out = Writer::new(Vec::new());

    let mut depth = 0usize;
    let mut body_depth: Option<usize> = None;
    let mut payload_depth: Option<usize> = None;
    let mut is_fault = false;
    let mut done = false;

    let mut buf = Vec::new();

    while !done {
        buf.clear();
        let (ns, event) = reader.read_resolved_event_into(&mut buf)?;
        let soap_ns = matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == SOAP_11_NS.as_bytes());

        match event {
            Event::Start(ref e) => {
                depth += 1;
                let local = e.local_name();

                if payload_depth.is_some() {
                    out.write_event(Event::Start(local_start(e)?))?;
                } else if depth == 1 {
                    if local.as_ref() != b"Envelope" {
                        return Err(SoapClientError::InvalidEnvelope(
                            "Root element is not a SOAP Envelope".to_string(),
                        ));
                    }
                    if !soap_ns {
                        return Err(SoapClientError::InvalidEnvelope(
                            "Envelope is not in the SOAP 1.1 namespace".to_string(),
                        ));
                    }
                } else if depth == 2 && soap_ns && local.as_ref() == b"Body" {
                    body_depth = Some(depth);
                } else if body_depth == Some(depth - 1) {
                    payload_depth = Some(depth);
                    is_fault = soap_ns && local.as_ref() == b"Fault";
                    out.write_event(Event::Start(local_start(e)?))?;
                }
            }
            Event::Empty(ref e) => {
                if payload_depth.is_some() {
                    out.write_event(Event::Empty(local_start(e)?))?;
                } else if body_depth == Some(depth) {
                    is_fault = soap_ns && e.local_name().as_ref() == b"Fault";
                    out.write_event(Event::Empty(local_start(e)?))?;
                    done = true;
                }
            }
            Event::End(ref e) => {
                if payload_depth.is_some() {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    out.write_event(Event::End(BytesEnd::new(name)))?;
                }
                if payload_depth == Some(depth) {
                    done = true;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(e) if payload_depth.is_some() => out.write_event(Event::Text(e))?,
            Event::CData(e) if payload_depth.is_some() => out.write_event(Event::CData(e))?,
            Event::DocType(_) => {
                return Err(SoapClientError::XxeDetected(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if body_depth.is_none() {
        return Err(SoapClientError::InvalidEnvelope("Missing SOAP Body".to_string()));
    }
    if !done {
        return Err(SoapClientError::InvalidEnvelope("SOAP Body is empty".to_string()));
    }

    Ok(BodyPayload {
        xml: out.into_inner(),
        is_fault,
    })
}

/// Copy of `e` with the local name and without namespace declarations.
fn local_start(e: &BytesStart) -> Result<BytesStart<'static>> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut start = BytesStart::new(name);

    for attr in e.attributes() {
        let attr = attr.map_err(|err| SoapClientError::XmlParse(err.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        start.push_attribute((attr.key.local_name().as_ref(), attr.value.as_ref()));
    }

    Ok(start)
}
