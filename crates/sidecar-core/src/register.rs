//! Inbound REGISTER handling
//!
//! Authentication happens upstream in the SIP stack; this handler receives
//! the already-authorized request with the grant the auth step produced.
//!
//! UDP clients are assumed to sit behind NAT. They are told to refresh
//! every `nat_expires` seconds so their pinhole stays open, while the
//! binding is stored with the full granted expiry.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{Result, SidecarError};
use crate::registrar::{RegistrationBinding, Registrar};
use crate::sip::{rewrite_contact_expires, InboundRequest, SipMessage, SipReply, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Register,
    Unregister,
}

/// Result of the authorization step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationGrant {
    /// Expiry granted by the auth hook, if it chose one
    pub expires: Option<u32>,
    pub call_hook: Option<String>,
    pub call_status_hook: Option<String>,
    pub allow_direct_app_calling: bool,
    pub allow_direct_queue_calling: bool,
    pub allow_direct_user_calling: bool,
}

/// An authorized REGISTER
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub request: InboundRequest,
    /// Address of record from the To header, e.g. `sip:alice@example.com`
    pub aor: String,
    /// Expiry the client asked for
    pub expires: u32,
    pub kind: RegistrationKind,
    pub grant: AuthorizationGrant,
}

pub struct InboundRegistrationHandler {
    registrar: Arc<dyn Registrar>,
    nat_expires: u32,
    private_sbc_address: Option<String>,
}

impl InboundRegistrationHandler {
    pub fn new(registrar: Arc<dyn Registrar>, nat_expires: u32) -> Self {
        Self {
            registrar,
            nat_expires,
            private_sbc_address: None,
        }
    }

    pub fn with_private_sbc_address(mut self, address: impl Into<String>) -> Self {
        self.private_sbc_address = Some(address.into());
        self
    }

    pub async fn handle(&self, reg: &RegistrationRequest) -> SipReply {
        let req = &reg.request;
        debug!(
            "received REGISTER from {}/{}:{}",
            req.protocol, req.source_address, req.source_port
        );

        let result = if reg.kind == RegistrationKind::Register && reg.expires != 0 {
            self.register(reg).await
        } else {
            self.unregister(reg).await
        };

        result.unwrap_or_else(|e| {
            error!(aor = %reg.aor, "Error trying to process REGISTER: {}", e);
            SipReply::new(500)
        })
    }

    async fn register(&self, reg: &RegistrationRequest) -> Result<SipReply> {
        let req = &reg.request;
        let aor = normalize_aor(&reg.aor)?;
        let granted = reg.grant.expires.filter(|e| *e > 0).unwrap_or(reg.expires);
        let advertised = if req.protocol == Transport::Udp {
            granted.min(self.nat_expires)
        } else {
            granted
        };

        let contact_header = req
            .header("Contact")
            .ok_or_else(|| SidecarError::internal("REGISTER without Contact"))?;
        let contact_uri = req
            .contacts()
            .into_iter()
            .next()
            .map(|c| c.uri)
            .ok_or_else(|| SidecarError::internal("unparseable Contact header"))?;

        let binding = RegistrationBinding {
            contact: contact_uri,
            sbc_address: req.server_hostport.clone(),
            private_sbc_address: self.private_sbc_address.clone(),
            protocol: via_transport(req).map(str::to_string),
            proxy: format!("sip:{}:{}", req.source_address, req.source_port),
            call_hook: reg.grant.call_hook.clone(),
            call_status_hook: reg.grant.call_status_hook.clone(),
            allow_direct_app_calling: reg.grant.allow_direct_app_calling,
            allow_direct_queue_calling: reg.grant.allow_direct_queue_calling,
            allow_direct_user_calling: reg.grant.allow_direct_user_calling,
        };
        debug!(aor = %aor, "adding aor with expires {}", granted);
        self.registrar.add(&aor, &binding, granted).await?;

        Ok(SipReply::ok()
            .with_header("Contact", rewrite_contact_expires(contact_header, advertised))
            .with_header("Expires", advertised.to_string()))
    }

    async fn unregister(&self, reg: &RegistrationRequest) -> Result<SipReply> {
        let aor = normalize_aor(&reg.aor)?;
        let removed = self.registrar.remove(&aor).await?;
        debug!(aor = %aor, removed, "successfully unregistered");

        let mut reply = SipReply::ok();
        if let Some(contact) = reg.request.header("Contact") {
            reply = reply.with_header("Contact", contact);
        }
        Ok(reply.with_header("Expires", "0"))
    }
}

/// Reduce an AOR URI to `user@host`
pub fn normalize_aor(aor: &str) -> Result<String> {
    let invalid = || SidecarError::internal(format!("invalid AOR {}", aor));

    let uri = aor.trim().trim_start_matches('<');
    let uri = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let uri = uri.split(['>', ';', '?']).next().unwrap_or_default();

    let (user, hostport) = uri.split_once('@').ok_or_else(invalid)?;
    let host = if let Some(rest) = hostport.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        hostport.split(':').next().unwrap_or_default()
    };
    if user.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    Ok(format!("{}@{}", user, host))
}

/// Transport named in the top Via, if it is one a binding can be reached on
pub fn via_transport(req: &InboundRequest) -> Option<&'static str> {
    let via = req.header("Via")?;
    let sent_protocol = via.split_whitespace().next()?;
    let transport = sent_protocol.rsplit('/').next()?.to_ascii_lowercase();
    ["wss", "ws", "tcp", "udp"]
        .into_iter()
        .find(|t| transport.starts_with(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::SipMethod;

    #[test]
    fn aor_is_reduced_to_user_at_host() {
        assert_eq!(normalize_aor("sip:alice@example.com").unwrap(), "alice@example.com");
        assert_eq!(normalize_aor("<sips:bob@10.0.0.1:5061;transport=tls>").unwrap(), "bob@10.0.0.1");
        assert_eq!(normalize_aor("sip:carol@[2001:db8::1]:5060").unwrap(), "carol@2001:db8::1");
        assert!(normalize_aor("sip:example.com").is_err());
    }

    #[test]
    fn via_transport_is_read_from_sent_protocol() {
        let req = InboundRequest::new(SipMethod::Register, "1.2.3.4", 5060)
            .with_header("Via", "SIP/2.0/WSS df7jal23ls0d.invalid;branch=z9hG4bK");
        assert_eq!(via_transport(&req), Some("wss"));

        let req = InboundRequest::new(SipMethod::Register, "1.2.3.4", 5060)
            .with_header("v", "SIP/2.0/UDP 1.2.3.4:5060;rport");
        assert_eq!(via_transport(&req), Some("udp"));

        let req = InboundRequest::new(SipMethod::Register, "1.2.3.4", 5060)
            .with_header("Via", "SIP/2.0/TLS 1.2.3.4:5061");
        assert_eq!(via_transport(&req), None);
    }
}
