//! Heartbeat endpoint authentication: optional shared-secret header and
//! optional caller-IP allowlist, both checked before any tick logic runs.
//!
//! The configuration is an explicit object handed to the router at
//! construction time, never process-global state.

use std::env;
use std::net::IpAddr;

use anyhow::{Context, Result};
use tracing::warn;

pub const TOKEN_HEADER: &str = "x-heartbeat-token";

#[derive(Debug, Clone, Default)]
pub struct HeartbeatConfig {
    /// Shared secret expected in the `X-Heartbeat-Token` header. `None`
    /// disables authentication.
    pub token: Option<String>,
    /// Caller IPs allowed to trigger a tick. `None` disables the check.
    pub allowed_ips: Option<Vec<IpAddr>>,
}

impl HeartbeatConfig {
    /// Read `HEARTBEAT_TOKEN` and `HEARTBEAT_ALLOWED_IPS` (comma-separated)
    /// from the environment.
    pub fn from_env() -> Result<Self> {
        let token = env::var("HEARTBEAT_TOKEN").ok().filter(|t| !t.is_empty());

        let allowed_ips = match env::var("HEARTBEAT_ALLOWED_IPS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let ips = raw
                    .split(',')
                    .map(|part| {
                        part.trim()
                            .parse::<IpAddr>()
                            .with_context(|| format!("invalid IP in HEARTBEAT_ALLOWED_IPS: '{part}'"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(ips)
            }
            _ => None,
        };

        Ok(Self { token, allowed_ips })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// Missing or wrong shared secret.
    Unauthorized,
    /// Caller IP not on the allowlist.
    Forbidden,
}

/// Run both checks in order: token first, then allowlist. Either failure
/// means the request never reaches tick logic.
pub fn authorize(
    config: &HeartbeatConfig,
    presented_token: Option<&str>,
    peer: IpAddr,
) -> std::result::Result<(), AuthRejection> {
    if let Some(expected) = &config.token {
        if !secure_compare(presented_token.unwrap_or(""), expected) {
            warn!(%peer, "heartbeat authentication failed");
            return Err(AuthRejection::Unauthorized);
        }
    }

    if let Some(allowlist) = &config.allowed_ips {
        if !allowlist.contains(&peer) {
            warn!(%peer, "heartbeat IP allowlist rejection");
            return Err(AuthRejection::Forbidden);
        }
    }

    Ok(())
}

/// Constant-time equality: compare blake3 digests instead of the raw
/// strings (`blake3::Hash` equality is documented constant-time), so the
/// comparison leaks nothing about the expected token.
fn secure_compare(presented: &str, expected: &str) -> bool {
    blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes())
}
