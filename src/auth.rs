//! Trusted-proxy authentication.
//!
//! Identity comes from `Remote-User` / `Remote-Email` / `Remote-Groups` /
//! `Remote-Name` headers set by an authenticating reverse proxy (Authelia,
//! OAuth2 Proxy, ...). The headers are honored only when the *immediate*
//! peer IP is on the trusted-proxy allowlist; anything else is treated as
//! anonymous, because arbitrary clients can forge headers.

use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;

pub const REMOTE_USER_HEADER: &str = "Remote-User";
pub const REMOTE_EMAIL_HEADER: &str = "Remote-Email";
pub const REMOTE_GROUPS_HEADER: &str = "Remote-Groups";
pub const REMOTE_NAME_HEADER: &str = "Remote-Name";

/// Authenticated user identity from proxy headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One allowlist entry: a single address or a CIDR range.
#[derive(Debug, Clone)]
enum TrustedEntry {
    Addr(IpAddr),
    Net(IpNet),
}

/// Parsed trusted-proxy allowlist.
#[derive(Debug, Clone)]
pub struct TrustedProxies {
    entries: Vec<TrustedEntry>,
    enabled: bool,
}

impl TrustedProxies {
    /// Parse a comma-separated list of IPs and CIDR ranges. Invalid entries
    /// are logged and skipped.
    pub fn parse(spec: &str, enabled: bool) -> Self {
        let mut entries = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.contains('/') {
                match part.parse::<IpNet>() {
                    Ok(net) => entries.push(TrustedEntry::Net(net)),
                    Err(_) => tracing::warn!(entry = part, "invalid CIDR in trusted proxy list"),
                }
            } else {
                match part.parse::<IpAddr>() {
                    Ok(addr) => entries.push(TrustedEntry::Addr(addr)),
                    Err(_) => tracing::warn!(entry = part, "invalid IP in trusted proxy list"),
                }
            }
        }
        Self { entries, enabled }
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.entries.iter().any(|entry| match entry {
            TrustedEntry::Addr(addr) => *addr == ip,
            TrustedEntry::Net(net) => net.contains(&ip),
        })
    }

    /// Resolve the identity for a request.
    ///
    /// `peer` is the socket peer; `header` looks up a request header by name.
    /// Returns `None` (anonymous) when auth is disabled, the peer is not
    /// allowlisted, or no `Remote-User` header is present.
    pub fn identify<'a>(
        &self,
        peer: IpAddr,
        header: impl Fn(&str) -> Option<&'a str>,
    ) -> Option<User> {
        if !self.enabled {
            return None;
        }
        if !self.is_trusted(peer) {
            if header(REMOTE_USER_HEADER).is_some() {
                tracing::warn!(peer = %peer, "auth headers received from untrusted peer, ignoring");
            }
            return None;
        }

        let username = header(REMOTE_USER_HEADER)?.trim();
        if username.is_empty() {
            return None;
        }

        let groups = header(REMOTE_GROUPS_HEADER)
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Some(User {
            username: username.to_string(),
            email: header(REMOTE_EMAIL_HEADER).map(String::from),
            groups,
            display_name: header(REMOTE_NAME_HEADER).map(String::from),
        })
    }
}

/// Extract the client IP: leftmost `X-Forwarded-For` entry if present,
/// else the socket peer.
pub fn client_ip(forwarded_for: Option<&str>, socket_peer: IpAddr) -> IpAddr {
    forwarded_for
        .and_then(|h| h.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(socket_peer)
}
