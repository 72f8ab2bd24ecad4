//! Registration interval negotiation

use std::time::Duration;

use tracing::debug;

use crate::sip::SipMessage;

/// Expires granted by a 200 OK to REGISTER
///
/// The first Contact's `expires` parameter wins over the Expires header
/// (RFC 3261 §10.2.4); with neither, `default_expires` is assumed. A value
/// that is not a number, or is below `min_expires`, becomes `min_expires`.
pub fn effective_expires<M: SipMessage + ?Sized>(response: &M, default_expires: u32, min_expires: u32) -> u32 {
    let mut granted = Some(default_expires);

    if let Some(header) = response.expires_header() {
        granted = header.parse::<u32>().ok();
    }

    match response.contacts().first() {
        Some(contact) => {
            if let Some(param) = contact.expires() {
                granted = param.trim().parse::<u32>().ok();
            }
        }
        None => debug!("no Contact header in 200 OK"),
    }

    match granted {
        Some(expires) if expires >= min_expires => expires,
        other => {
            debug!(?other, "expires too small or missing, using {}", min_expires);
            min_expires
        }
    }
}

/// Delay before refreshing a registration granted for `expires` seconds
pub fn refresh_delay(expires: u32) -> Duration {
    Duration::from_millis(u64::from(expires) * 500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::SipResponse;

    fn ok() -> SipResponse {
        SipResponse::new(200, "OK")
    }

    #[test]
    fn contact_param_wins_over_header() {
        let res = ok()
            .with_header("Contact", "<sip:u@h>;expires=45")
            .with_header("Expires", "600");
        assert_eq!(effective_expires(&res, 3600, 30), 45);
        assert_eq!(refresh_delay(45), Duration::from_millis(22_500));
    }

    #[test]
    fn contact_param_is_clamped_to_minimum() {
        let res = ok().with_header("Contact", "<sip:u@h>;expires=45");
        assert_eq!(effective_expires(&res, 3600, 60), 60);
    }

    #[test]
    fn expires_header_used_without_contact() {
        let res = ok().with_header("Expires", "20");
        assert_eq!(effective_expires(&res, 3600, 30), 30);

        let res = ok().with_header("Expires", "1800");
        assert_eq!(effective_expires(&res, 3600, 30), 1800);
    }

    #[test]
    fn default_used_when_nothing_is_granted() {
        assert_eq!(effective_expires(&ok(), 3600, 30), 3600);
        let res = ok().with_header("Contact", "<sip:u@h>");
        assert_eq!(effective_expires(&res, 3600, 30), 3600);
    }

    #[test]
    fn non_numeric_values_fall_to_minimum() {
        let res = ok().with_header("Expires", "soon");
        assert_eq!(effective_expires(&res, 3600, 30), 30);
    }
}
