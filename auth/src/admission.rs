//! The admission decision.

use std::net::IpAddr;

use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::{AccessMode, SecurityConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("source address {0} is not permitted")]
    IpNotAllowed(IpAddr),
}

impl AuthError {
    /// HTTP status for this failure: 401 for credential problems, 403 for
    /// address policy.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => 401,
            Self::IpNotAllowed(_) => 403,
        }
    }
}

/// What the HTTP layer extracted from one request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub source_ip: IpAddr,
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn bearer_token(authorization: Option<&str>) -> Option<String> {
    let value = authorization?.trim();
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve the source address: first hop of `X-Forwarded-For` when present,
/// the socket peer otherwise.
pub fn source_ip(forwarded_for: Option<&str>, peer: IpAddr) -> IpAddr {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer)
}

/// Admit or deny a request under the supplied security record.
pub fn authorize(config: &SecurityConfig, credentials: &Credentials) -> Result<(), AuthError> {
    match config.mode {
        AccessMode::Lax => {
            if credentials.source_ip.is_loopback() {
                Ok(())
            } else {
                Err(AuthError::IpNotAllowed(credentials.source_ip))
            }
        }
        AccessMode::Relaxed => check_key(config, credentials),
        AccessMode::Strict => {
            check_key(config, credentials)?;
            if config.allowed_ips.contains(&credentials.source_ip) {
                Ok(())
            } else {
                Err(AuthError::IpNotAllowed(credentials.source_ip))
            }
        }
    }
}

fn check_key(config: &SecurityConfig, credentials: &Credentials) -> Result<(), AuthError> {
    let presented = credentials.bearer.as_deref().ok_or(AuthError::MissingApiKey)?;
    let valid = config
        .api_keys
        .iter()
        .any(|key| key.as_bytes().ct_eq(presented.as_bytes()).into());
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn remote() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    fn keyed_config(mode: AccessMode) -> SecurityConfig {
        SecurityConfig {
            mode,
            api_keys: vec!["secret-key".to_string()],
            allowed_ips: vec![remote()],
            ..SecurityConfig::default()
        }
    }

    fn with_key(ip: IpAddr, key: Option<&str>) -> Credentials {
        Credentials {
            bearer: key.map(String::from),
            source_ip: ip,
        }
    }

    #[test]
    fn test_lax_admits_localhost_only() {
        let config = SecurityConfig::default();
        assert!(authorize(&config, &with_key(localhost(), None)).is_ok());
        assert_eq!(
            authorize(&config, &with_key(remote(), None)),
            Err(AuthError::IpNotAllowed(remote()))
        );
    }

    #[test]
    fn test_relaxed_requires_valid_key() {
        let config = keyed_config(AccessMode::Relaxed);
        assert!(authorize(&config, &with_key(remote(), Some("secret-key"))).is_ok());
        assert_eq!(
            authorize(&config, &with_key(remote(), None)),
            Err(AuthError::MissingApiKey)
        );
        assert_eq!(
            authorize(&config, &with_key(remote(), Some("wrong"))),
            Err(AuthError::InvalidApiKey)
        );
    }

    #[test]
    fn test_strict_requires_key_and_allowlisted_ip() {
        let config = keyed_config(AccessMode::Strict);
        assert!(authorize(&config, &with_key(remote(), Some("secret-key"))).is_ok());
        assert_eq!(
            authorize(&config, &with_key(localhost(), Some("secret-key"))),
            Err(AuthError::IpNotAllowed(localhost()))
        );
        assert_eq!(
            authorize(&config, &with_key(remote(), Some("nope"))),
            Err(AuthError::InvalidApiKey)
        );
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc".to_string()));
        assert_eq!(bearer_token(Some("bearer xyz ")), Some("xyz".to_string()));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn test_source_ip_prefers_forwarded_header() {
        assert_eq!(
            source_ip(Some("198.51.100.4, 10.0.0.1"), localhost()),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(source_ip(Some("garbage"), localhost()), localhost());
        assert_eq!(source_ip(None, localhost()), localhost());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::MissingApiKey.http_status(), 401);
        assert_eq!(AuthError::InvalidApiKey.http_status(), 401);
        assert_eq!(AuthError::IpNotAllowed(remote()).http_status(), 403);
    }
}
