//! Identifier resolution for admission control.
//!
//! A request is billed against exactly one identifier: the authenticated user
//! id, or the caller's normalized network address, depending on the policy's
//! [`IdentifierStrategy`].

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Canonical identifier shared by every loopback address.
pub const LOOPBACK_IDENTIFIER: &str = "localhost";

/// How a policy derives the identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierStrategy {
    /// Bill the normalized network address
    Ip,
    /// Bill the authenticated user id
    Token,
    /// Authenticated user id when present, network address otherwise
    Hybrid,
}

/// What kind of key a request ended up being billed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Ip,
    Token,
}

impl IdentifierKind {
    /// Value used in the `X-RateLimit-Type` header and rejection body.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Ip => "ip",
            IdentifierKind::Token => "token",
        }
    }
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved admission-control key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    /// The store key
    pub key: String,
    /// Whether the key is a user id or an address
    pub kind: IdentifierKind,
}

impl Identifier {
    /// Identifier for an authenticated user.
    pub fn token(user_id: impl Into<String>) -> Self {
        Self {
            key: user_id.into(),
            kind: IdentifierKind::Token,
        }
    }

    /// Identifier for a network address, normalized.
    ///
    /// Returns `None` when the address is empty.
    pub fn address(raw: &str) -> Option<Self> {
        normalize_address(raw).map(|key| Self {
            key,
            kind: IdentifierKind::Ip,
        })
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Authenticated identity attached to a request by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Stable user id
    pub user_id: String,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Everything the resolver needs to know about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Authenticated identity, if the request carried one
    pub caller: Option<CallerIdentity>,
    /// Raw network address of the caller, if known
    pub remote_addr: Option<String>,
}

impl RequestOrigin {
    /// Origin of an anonymous request from `addr`.
    pub fn anonymous(addr: impl Into<String>) -> Self {
        Self {
            caller: None,
            remote_addr: Some(addr.into()),
        }
    }

    /// Attach an authenticated identity.
    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Resolve the identifier to bill under `strategy`.
    ///
    /// Returns `None` when no usable identifier exists; such requests are
    /// admitted without limiting.
    pub fn resolve(&self, strategy: IdentifierStrategy) -> Option<Identifier> {
        let resolved = match strategy {
            IdentifierStrategy::Token => {
                let token = self.token_identifier();
                if token.is_none() {
                    warn!(
                        remote_addr = ?self.remote_addr,
                        "Token policy applied to an unauthenticated request; skipping limits"
                    );
                }
                token
            }
            IdentifierStrategy::Ip => self.address_identifier(),
            IdentifierStrategy::Hybrid => self
                .token_identifier()
                .or_else(|| self.address_identifier()),
        };

        if resolved.is_none() {
            debug!(strategy = ?strategy, "Identifier unresolvable");
        }

        resolved
    }

    fn token_identifier(&self) -> Option<Identifier> {
        self.caller
            .as_ref()
            .map(|caller| caller.user_id.trim())
            .filter(|user_id| !user_id.is_empty())
            .map(Identifier::token)
    }

    fn address_identifier(&self) -> Option<Identifier> {
        self.remote_addr.as_deref().and_then(Identifier::address)
    }
}

/// Normalize a network address into a store key.
///
/// Loopback addresses of either family collapse to [`LOOPBACK_IDENTIFIER`],
/// IPv4-mapped IPv6 addresses are reduced to their IPv4 form, and anything
/// that does not parse as an IP (a hostname) is lowercased.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(ip) = trimmed.parse::<IpAddr>() else {
        return Some(trimmed.to_ascii_lowercase());
    };

    let ip = match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    if ip.is_loopback() {
        Some(LOOPBACK_IDENTIFIER.to_string())
    } else {
        Some(ip.to_string())
    }
}
