//! Configuration for a connector node.
//!
//! Configuration is a JSON file (path from `--config` / `$CONFIG`, default
//! `config.json`) deserialized with serde. Scalar defaults fall back to
//! environment variables, then to hardcoded values. Secret-bearing fields
//! (`authToken`, `privateKey`, admin `apiKey`) accept `$VAR` / `${VAR}`
//! references resolved at load time via [`LiteralOrEnv`].

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::address::Address;
use crate::claim::ChannelOwner;
use crate::types::{ChainTag, PeerId};

/// CLI arguments for the connector node.
#[derive(Parser, Debug)]
#[command(name = "agentmesh")]
#[command(about = "agentmesh connector node")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Deployment environment, gating the hardening checks in [`NodeConfig::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

/// How the local terminator delivers payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Payload handler is linked into the process; the HTTP delivery path is
    /// forbidden.
    Embedded,
    /// Payload handler is a separate service reached over HTTP.
    #[default]
    Standalone,
}

/// Node configuration. Field names match the wire/config vocabulary
/// (camelCase) throughout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Identity used in logs, telemetry, and the peer handshake.
    pub node_id: String,
    #[serde(default = "config_defaults::default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "config_defaults::default_health_port")]
    pub health_port: u16,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    /// Initial peer dial list.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Initial routing table.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Prefixes this node terminates locally instead of forwarding.
    #[serde(default)]
    pub local_prefixes: Vec<Address>,
    /// Local-delivery endpoint, required in standalone mode when
    /// `localPrefixes` is non-empty.
    #[serde(default)]
    pub handler_url: Option<Url>,
    #[serde(default)]
    pub admin_api: AdminApiConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub settlement_infra: Option<SettlementInfraConfig>,
    /// Session heartbeat interval `H`; staleness fires at `3H`.
    #[serde(default = "config_defaults::default_heartbeat_secs")]
    pub heartbeat_secs: u16,
    /// Shutdown window for in-flight packets.
    #[serde(default = "config_defaults::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "config_defaults::default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "config_defaults::default_ledger_snapshot_path")]
    pub ledger_snapshot_path: PathBuf,
    /// Per-session egress queue bound (`Qmax`).
    #[serde(default = "config_defaults::default_max_egress_queue")]
    pub max_egress_queue: usize,
}

/// One entry of the initial peer dial list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub id: PeerId,
    /// `host:port` of the peer's listener.
    pub endpoint: String,
    /// Shared secret presented and checked during the handshake.
    pub auth_token: LiteralOrEnv<String>,
    /// Off-chain channel bootstrap for this peer, used until the chain
    /// adapter reports authoritative state.
    #[serde(default)]
    pub channel: Option<PeerChannelConfig>,
}

/// Channel bootstrap values for a peer on the configured chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerChannelConfig {
    pub deposit: u64,
    pub channel_owner: ChannelOwner,
}

/// One entry of the initial routing table. An empty `prefix` is the
/// explicitly configured catch-all default route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub prefix: String,
    pub next_hop: PeerId,
    #[serde(default)]
    pub priority: i32,
}

/// Admin surface authentication.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminApiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Presented by clients in `X-Api-Key`; compared in constant time.
    #[serde(default)]
    pub api_key: Option<LiteralOrEnv<String>>,
    /// Individual IPs and CIDR blocks allowed to call admin endpoints.
    #[serde(default, alias = "allowedIPs")]
    pub allowed_ips: Vec<IpPattern>,
    /// Trust the first `X-Forwarded-For` entry as the client address.
    #[serde(default)]
    pub trust_proxy: bool,
}

/// Settlement thresholds and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Accumulated owed amount that triggers settlement.
    #[serde(default = "settlement_defaults::default_threshold")]
    pub threshold: u64,
    /// Retry cadence for failed settlement submissions.
    #[serde(default = "settlement_defaults::default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Per-submission timeout.
    #[serde(default = "settlement_defaults::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            enabled: false,
            threshold: settlement_defaults::default_threshold(),
            polling_interval_ms: settlement_defaults::default_polling_interval_ms(),
            timeout_secs: settlement_defaults::default_timeout_secs(),
        }
    }
}

mod settlement_defaults {
    pub fn default_threshold() -> u64 {
        1_000_000
    }
    pub fn default_polling_interval_ms() -> u64 {
        5_000
    }
    pub fn default_timeout_secs() -> u64 {
        30
    }
}

/// Chain linkage for the configured settlement family.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementInfraConfig {
    /// ed25519 signing key for outgoing claims.
    pub private_key: LiteralOrEnv<SigningKeyHex>,
    pub rpc_url: Url,
    /// Channel registry account on chain.
    pub registry_address: String,
    /// Token the channels denominate in.
    pub token_address: String,
    #[serde(default = "infra_defaults::default_chain_tag")]
    pub chain_tag: ChainTag,
    /// Numeric chain id; checked against the mainnet id in prod.
    #[serde(default = "infra_defaults::default_chain_id")]
    pub chain_id: u64,
}

mod infra_defaults {
    use crate::types::ChainTag;

    pub fn default_chain_tag() -> ChainTag {
        ChainTag::new("APTOS").unwrap()
    }
    pub fn default_chain_id() -> u64 {
        1
    }
}

// ============================================================================
// Environment variable resolution
// ============================================================================

/// A transparent wrapper resolving environment variables at deserialization.
///
/// Accepts a literal value, `$VAR`, or `${VAR}`. Implements `Deref` for
/// transparent access to the resolved inner value.
#[derive(Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }

    #[cfg(test)]
    pub fn literal(value: T) -> Self {
        LiteralOrEnv(value)
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(rest) = s.strip_prefix("${") {
            return rest.strip_suffix('}').map(str::to_string);
        }
        if let Some(name) = s.strip_prefix('$') {
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Some(name.to_string());
            }
        }
        None
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Never print resolved secrets.
impl<T> fmt::Debug for LiteralOrEnv<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LiteralOrEnv(..)")
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

// ============================================================================
// Signing key
// ============================================================================

/// A validated 32-byte ed25519 seed, hex-encoded in config (`0x` optional).
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKeyHex([u8; 32]);

impl SigningKeyHex {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for SigningKeyHex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| format!("Invalid hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("Private key must be 32 bytes, got {}", b.len()))?;
        Ok(SigningKeyHex(arr))
    }
}

impl fmt::Debug for SigningKeyHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKeyHex(..)")
    }
}

/// Seeds that must never reach production: the all-zero and all-one seeds,
/// and the sequential bytes pattern that circulates in examples.
const KNOWN_WEAK_SEEDS: [[u8; 32]; 3] = [
    [0x00; 32],
    [0xff; 32],
    [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e,
        0x1f, 0x20,
    ],
];

// ============================================================================
// IP allowlist patterns
// ============================================================================

/// One admin allowlist entry: a single address or a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPattern {
    Addr(IpAddr),
    Cidr(CidrBlock),
}

impl IpPattern {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpPattern::Addr(a) => *a == ip,
            IpPattern::Cidr(c) => c.contains(ip),
        }
    }
}

impl FromStr for IpPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            s.parse::<CidrBlock>().map(IpPattern::Cidr)
        } else {
            s.parse::<IpAddr>()
                .map(IpPattern::Addr)
                .map_err(|e| format!("invalid IP address {s:?}: {e}"))
        }
    }
}

impl fmt::Display for IpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPattern::Addr(a) => write!(f, "{a}"),
            IpPattern::Cidr(c) => write!(f, "{c}"),
        }
    }
}

impl Serialize for IpPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IpPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A CIDR block, v4 (prefix 0–32) or v6 (prefix 0–128).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    addr: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - self.prefix as u32;
                (u32::from(net) ^ u32::from(ip)) >> shift == 0
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - self.prefix as u32;
                (u128::from(net) ^ u128::from(ip)) >> shift == 0
            }
            _ => false,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR {s:?}: missing '/'"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid CIDR {s:?}: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid CIDR prefix in {s:?}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("CIDR prefix {prefix} out of range for {addr}"));
        }
        Ok(CidrBlock { addr, prefix })
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

pub mod config_defaults {
    use std::env;
    use std::path::PathBuf;

    pub const DEFAULT_LISTEN_PORT: u16 = 7011;
    pub const DEFAULT_HEALTH_PORT: u16 = 8080;

    pub fn default_listen_port() -> u16 {
        env::var("LISTEN_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LISTEN_PORT)
    }

    pub fn default_health_port() -> u16 {
        env::var("HEALTH_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HEALTH_PORT)
    }

    pub fn default_heartbeat_secs() -> u16 {
        10
    }

    pub fn default_drain_timeout_secs() -> u64 {
        10
    }

    pub fn default_snapshot_interval_secs() -> u64 {
        30
    }

    pub fn default_ledger_snapshot_path() -> PathBuf {
        PathBuf::from("ledger-snapshot.json")
    }

    pub fn default_max_egress_queue() -> usize {
        1024
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid config field {field}: {reason}")]
    Validation { field: String, reason: String },
}

/// A non-fatal validation finding, reported when `environment` is not prod.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub reason: String,
}

impl NodeConfig {
    /// Load configuration from CLI arguments and the JSON file they name.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The chain tag channels meter against, from `settlementInfra`.
    pub fn chain_tag(&self) -> ChainTag {
        self.settlement_infra
            .as_ref()
            .map(|i| i.chain_tag.clone())
            .unwrap_or_else(infra_defaults::default_chain_tag)
    }

    /// Environment-gated validation: violations are fatal in prod and
    /// downgraded to warnings elsewhere. Structural errors (duplicate peer
    /// ids) are always fatal.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut findings: Vec<ConfigWarning> = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.clone()) {
                return Err(ConfigError::Validation {
                    field: "peers".into(),
                    reason: format!("duplicate peer id {}", peer.id),
                });
            }
        }

        if let Some(infra) = &self.settlement_infra {
            let host = infra.rpc_url.host_str().unwrap_or("");
            let is_loopback = host == "localhost"
                || host
                    .parse::<IpAddr>()
                    .map(|ip| ip.is_loopback())
                    .unwrap_or(false);
            if is_loopback {
                findings.push(ConfigWarning {
                    field: "settlementInfra.rpcUrl".into(),
                    reason: "RPC URL must not be loopback".into(),
                });
            }
            if infra.rpc_url.scheme() != "https" {
                findings.push(ConfigWarning {
                    field: "settlementInfra.rpcUrl".into(),
                    reason: "RPC URL must use TLS".into(),
                });
            }
            if let Some(mainnet) = mainnet_chain_id(&infra.chain_tag) {
                if infra.chain_id != mainnet {
                    findings.push(ConfigWarning {
                        field: "settlementInfra.chainId".into(),
                        reason: format!(
                            "chain id {} is not the {} mainnet id {}",
                            infra.chain_id, infra.chain_tag, mainnet
                        ),
                    });
                }
            }
            if KNOWN_WEAK_SEEDS.contains(infra.private_key.as_bytes()) {
                findings.push(ConfigWarning {
                    field: "settlementInfra.privateKey".into(),
                    reason: "private key is in the known-weak list".into(),
                });
            }
        } else if self.settlement.enabled {
            return Err(ConfigError::Validation {
                field: "settlementInfra".into(),
                reason: "settlement is enabled but settlementInfra is missing".into(),
            });
        }

        match self.deployment_mode {
            DeploymentMode::Embedded => {
                if self.handler_url.is_some() {
                    findings.push(ConfigWarning {
                        field: "handlerUrl".into(),
                        reason: "embedded deployment forbids the HTTP local-delivery path".into(),
                    });
                }
            }
            DeploymentMode::Standalone => {
                if !self.local_prefixes.is_empty() && self.handler_url.is_none() {
                    findings.push(ConfigWarning {
                        field: "handlerUrl".into(),
                        reason: "standalone local delivery requires handlerUrl".into(),
                    });
                }
            }
        }

        if self.admin_api.enabled
            && self.admin_api.api_key.is_none()
            && self.admin_api.allowed_ips.is_empty()
        {
            findings.push(ConfigWarning {
                field: "adminApi".into(),
                reason: "admin API requires an apiKey or a non-empty allowedIPs".into(),
            });
        }

        if self.environment == Environment::Prod {
            if let Some(first) = findings.into_iter().next() {
                return Err(ConfigError::Validation {
                    field: first.field,
                    reason: first.reason,
                });
            }
            return Ok(Vec::new());
        }
        Ok(findings)
    }
}

/// Mainnet chain ids for the chain families this node knows about.
fn mainnet_chain_id(tag: &ChainTag) -> Option<u64> {
    match tag.as_str() {
        "APTOS" => Some(1),
        _ => None,
    }
}
