pub mod firewalld;
pub mod iptables;
pub mod ufw;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::{FirewallError, Result};

pub use firewalld::Firewalld;
pub use iptables::NatHelper;
pub use ufw::Ufw;

// ===========================================================================
// Core Enumerations
// ===========================================================================

/// Rule strategy in the unified model. The simplified backend speaks
/// allow/deny instead; translation happens at that adapter's boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Accept,
    Drop,
}

impl Strategy {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(FirewallError::InvalidStrategy {
                strategy: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Add,
    Remove,
}

impl Operation {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            _ => Err(FirewallError::Internal(format!("invalid operation: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Which family of rule a natural key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Port,
    Address,
    Forward,
}

impl RuleKind {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "port" => Ok(Self::Port),
            "address" => Ok(Self::Address),
            "forward" => Ok(Self::Forward),
            _ => Err(FirewallError::Internal(format!("invalid rule kind: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::Address => "address",
            Self::Forward => "forward",
        }
    }
}

// ===========================================================================
// Rule Model
// ===========================================================================

/// Canonical representation of one packet-filter rule.
///
/// `port` keeps the caller's spelling: a single port, a comma list, or a
/// dash range. `address` empty means "any source". `protocol` may be the
/// dual pseudo-value `tcp/udp`; adapters never see it unsplit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FireInfo {
    /// ipv4 or ipv6, derived from the address during listing.
    pub family: String,
    /// Source CIDR/IP/range, empty = any.
    pub address: String,
    pub port: String,
    pub protocol: String,
    pub strategy: String,
    /// Whether a description record exists for this rule.
    #[serde(default)]
    pub used_status: bool,
    /// Annotation only; never sent to the backend.
    #[serde(default)]
    pub description: String,
}

impl FireInfo {
    /// Natural key used to correlate live rules with metadata records.
    pub fn natural_key(&self, kind: RuleKind) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            kind.as_str(),
            self.port,
            self.protocol,
            self.address,
            self.strategy
        )
    }
}

/// One port-forwarding rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FireForward {
    /// Backend-assigned ordinal; governs insertion order and deletion.
    #[serde(default)]
    pub num: u32,
    pub protocol: String,
    /// Source port.
    pub port: String,
    /// Defaults to loopback when empty.
    pub target_ip: String,
    pub target_port: String,
}

pub const LOOPBACK: &str = "127.0.0.1";

/// Fills the loopback default for an absent forward target.
pub fn forward_target_or_loopback(target_ip: &str) -> String {
    if target_ip.is_empty() {
        LOOPBACK.to_string()
    } else {
        target_ip.to_string()
    }
}

/// Derives the address family from a source spec. Bare ports have no
/// address and default to ipv4.
pub fn family_of(address: &str) -> &'static str {
    if address.contains(':') {
        "ipv6"
    } else {
        "ipv4"
    }
}

// ===========================================================================
// Capability Interface
// ===========================================================================

/// The single capability surface over both packet-filtering backends.
///
/// Mutation calls are synchronous from the caller's point of view: they
/// return once the underlying tool has accepted or rejected the change, with
/// captured stderr/stdout attached to failures. `reload` persists staged
/// configuration for the daemon-style backend and is a no-op for the
/// simplified one.
#[async_trait]
pub trait FirewallClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;

    /// true = running.
    async fn status(&self) -> Result<bool>;
    async fn version(&self) -> Result<String>;

    async fn list_port(&self) -> Result<Vec<FireInfo>>;
    async fn list_address(&self) -> Result<Vec<FireInfo>>;
    async fn list_forward(&self) -> Result<Vec<FireForward>>;

    /// Applies or removes a plain port rule (no source address).
    async fn port(&self, info: &FireInfo, op: Operation) -> Result<()>;

    /// Applies or removes a structured rule carrying an address and/or a
    /// non-accept strategy.
    async fn rich_rules(&self, info: &FireInfo, op: Operation) -> Result<()>;

    async fn port_forward(&self, forward: &FireForward, op: Operation) -> Result<()>;

    /// Makes sure the backend will actually forward: masquerade for the
    /// daemon backend, the dedicated NAT chain for the simplified one.
    async fn enable_forward(&self) -> Result<()>;
}

// ===========================================================================
// Backend Selection
// ===========================================================================

/// Probes for the two supported tools and returns the matching adapter.
///
/// Selection is done once per process; exactly one backend is active
/// system-wide and the choice never changes for the client's lifetime.
pub fn pick_client() -> Result<Arc<dyn FirewallClient>> {
    if which::which("firewall-cmd").is_ok() {
        return Ok(Arc::new(Firewalld::new()));
    }
    if which::which("ufw").is_ok() {
        return Ok(Arc::new(Ufw::new()));
    }
    Err(FirewallError::NoBackendAvailable)
}
