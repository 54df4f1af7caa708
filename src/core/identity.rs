//! Caller identities for throttling and blocking.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::utils::format_rate_limit_key;

/// Errors raised while deriving an identity from a request
#[derive(Error, Debug, PartialEq)]
pub enum IdentityError {
    #[error("malformed client address: {0:?}")]
    MalformedIdentity(String),
}

/// Whether a caller is authenticated. Scopes never share a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Authenticated,
    Anonymous,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Authenticated => "authenticated",
            RateLimitScope::Anonymous => "anonymous",
        }
    }

    fn key_tag(&self) -> &'static str {
        match self {
            RateLimitScope::Authenticated => "auth",
            RateLimitScope::Anonymous => "anon",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a rate-limit budget is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub scope: RateLimitScope,
    pub subject: String,
}

impl RateLimitKey {
    /// Authenticated callers are keyed by user id and address together.
    pub fn authenticated(user_id: &str, ip: IpAddr) -> Self {
        Self {
            scope: RateLimitScope::Authenticated,
            subject: format!("{}:{}", user_id, ip),
        }
    }

    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            scope: RateLimitScope::Anonymous,
            subject: ip.to_string(),
        }
    }

    /// Storage key of the window for this identity.
    pub fn storage_key(&self) -> String {
        format_rate_limit_key(
            "rate_limit",
            &format!("{}:{}", self.scope.key_tag(), self.subject),
        )
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.subject)
    }
}

/// Parse a textual address into an identity, normalising its form.
pub fn parse_identity(raw: &str) -> Result<IpAddr, IdentityError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<IpAddr>()
        .or_else(|_| trimmed.parse::<SocketAddr>().map(|addr| addr.ip()))
        .map_err(|_| IdentityError::MalformedIdentity(raw.to_string()))
}

/// Resolve the client address of a request.
///
/// When `trust_forwarded_for` is set the first `X-Forwarded-For` entry wins.
/// A malformed header falls back to the peer address.
pub fn client_ip(
    forwarded_for: Option<&str>,
    peer: Option<IpAddr>,
    trust_forwarded_for: bool,
) -> Result<IpAddr, IdentityError> {
    if trust_forwarded_for {
        if let Some(header) = forwarded_for {
            let first = header.split(',').next().unwrap_or_default();
            match parse_identity(first) {
                Ok(ip) => return Ok(ip),
                Err(e) => debug!("Ignoring forwarded address: {}", e),
            }
        }
    }

    peer.ok_or_else(|| IdentityError::MalformedIdentity(forwarded_for.unwrap_or_default().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let ip = client_ip(Some("203.0.113.7, 10.0.0.2"), Some(PEER), true).unwrap();
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_untrusted_header_is_ignored() {
        let ip = client_ip(Some("203.0.113.7"), Some(PEER), false).unwrap();
        assert_eq!(ip, PEER);
    }

    #[test]
    fn test_malformed_header_falls_back_to_peer() {
        let ip = client_ip(Some("not-an-ip"), Some(PEER), true).unwrap();
        assert_eq!(ip, PEER);
    }

    #[test]
    fn test_no_usable_address_is_malformed() {
        assert_eq!(
            client_ip(Some("garbage"), None, true),
            Err(IdentityError::MalformedIdentity("garbage".to_string()))
        );
        assert!(client_ip(None, None, true).is_err());
    }

    #[test]
    fn test_parse_identity_accepts_socket_addresses() {
        assert_eq!(parse_identity("[::1]:8080").unwrap(), "::1".parse::<IpAddr>().unwrap());
        assert_eq!(parse_identity(" 192.0.2.1 ").unwrap(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_scopes_never_share_a_key() {
        let anon = RateLimitKey::anonymous(PEER);
        let auth = RateLimitKey::authenticated("42", PEER);

        assert_eq!(anon.storage_key(), "rate_limit:anon:10.0.0.1");
        assert_eq!(auth.storage_key(), "rate_limit:auth:42:10.0.0.1");
        assert_ne!(anon.storage_key(), auth.storage_key());
    }
}
