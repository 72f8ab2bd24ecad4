//! SIP seam
//!
//! The SIP transport and parser live outside this crate. Everything here is
//! the thin interface the sidecar consumes: header access on requests and
//! responses, a client that sends a request and waits for its final
//! response, and the reply an inbound handler hands back to the stack.

mod addressing;
mod contact;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

pub use addressing::{is_ipv4_literal, is_valid_domain_or_ip, is_valid_ip};
pub use contact::{rewrite_contact_expires, Contact};

/// SIP methods the sidecar sends or handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Options,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Options => write!(f, "OPTIONS"),
        }
    }
}

/// Signalling transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Transport {
    /// Parse a gateway protocol column such as `udp`, `TCP` or `tls/srtp`.
    ///
    /// Only the part before `/` is significant. Unknown names fall back to UDP.
    pub fn from_protocol(protocol: &str) -> Self {
        let name = protocol.split('/').next().unwrap_or_default();
        match name.trim().to_ascii_lowercase().as_str() {
            "tcp" => Transport::Tcp,
            "tls" => Transport::Tls,
            "ws" => Transport::Ws,
            "wss" => Transport::Wss,
            _ => Transport::Udp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, case-insensitive header list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

/// RFC 3261 compact header forms for the headers the sidecar reads
fn canonical(name: &str) -> &str {
    match name {
        "m" | "M" => "Contact",
        "v" | "V" => "Via",
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        other => other,
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Builder form of [`Headers::push`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// Every value of a header, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let wanted = canonical(name);
        self.0
            .iter()
            .filter(|(n, _)| canonical(n).eq_ignore_ascii_case(wanted))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).into_iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// Header access shared by requests and responses
pub trait SipMessage {
    fn headers(&self) -> &Headers;

    fn has_header(&self, name: &str) -> bool {
        self.headers().get(name).is_some()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    /// Every Contact in the message, across repeated and comma-joined headers
    fn contacts(&self) -> Vec<Contact> {
        self.headers()
            .get_all("Contact")
            .into_iter()
            .flat_map(Contact::parse_list)
            .collect()
    }

    /// Raw value of the Expires header
    fn expires_header(&self) -> Option<&str> {
        self.header("Expires").map(str::trim)
    }
}

/// Final response to a request this sidecar sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }
}

impl SipMessage for SipResponse {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Request received from the network, already parsed by the SIP stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub source_address: String,
    pub source_port: u16,
    /// Transport the request arrived on
    pub protocol: Transport,
    /// Local `host:port` the request was received on
    pub server_hostport: String,
}

impl InboundRequest {
    pub fn new(method: SipMethod, source_address: impl Into<String>, source_port: u16) -> Self {
        Self {
            method,
            uri: String::new(),
            headers: Headers::new(),
            source_address: source_address.into(),
            source_port,
            protocol: Transport::Udp,
            server_hostport: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_protocol(mut self, protocol: Transport) -> Self {
        self.protocol = protocol;
        self
    }
}

impl SipMessage for InboundRequest {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Digest credentials for a challenged request
#[derive(Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Request for the SIP stack to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: SipMethod,
    pub uri: String,
    /// Next hop, e.g. `sip:10.0.0.1:5060;transport=udp`
    pub proxy: Option<String>,
    pub headers: Headers,
    pub auth: Option<DigestCredentials>,
}

impl OutboundRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            proxy: None,
            headers: Headers::new(),
            auth: None,
        }
    }
}

/// Reply an inbound handler asks the stack to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipReply {
    pub status: u16,
    pub headers: Headers,
}

impl SipReply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Sends requests through the SIP stack
///
/// The stack handles retransmission and digest challenges. Any final
/// response, success or not, is `Ok`; `Err` means no response arrived
/// (DNS failure, connection refused, transaction timeout).
#[async_trait]
pub trait SipClient: Send + Sync {
    async fn request(&self, request: OutboundRequest) -> Result<SipResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_taken_before_the_slash() {
        assert_eq!(Transport::from_protocol("tls/srtp"), Transport::Tls);
        assert_eq!(Transport::from_protocol("TCP"), Transport::Tcp);
        assert_eq!(Transport::from_protocol("udp"), Transport::Udp);
        assert_eq!(Transport::from_protocol(""), Transport::Udp);
    }

    #[test]
    fn header_lookup_ignores_case_and_compact_forms() {
        let res = SipResponse::new(200, "OK")
            .with_header("m", "<sip:a@b>;expires=60")
            .with_header("EXPIRES", "120");
        assert!(res.has_header("Contact"));
        assert_eq!(res.expires_header(), Some("120"));
        assert_eq!(res.contacts()[0].expires(), Some("60"));
    }

    #[test]
    fn credentials_are_not_printed() {
        let creds = DigestCredentials {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
