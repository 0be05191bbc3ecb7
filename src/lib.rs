//! Payment-routing fabric for autonomous agents.
//!
//! agentmesh is a mesh of connector nodes that forward conditional-payment
//! packets between peers over a bilateral transfer protocol, meter every
//! forwarded packet against off-chain payment channels, and settle on chain
//! when the accumulated imbalance crosses a threshold. Packet payloads carry
//! signed agent events; the fabric never interprets them.
//!
//! # Packet pipeline
//!
//! Ingress flows `peer session → codec → forwarder → (routing table OR local
//! terminator) → forwarder → codec → peer session`. A `Prepare` carries a
//! 32-byte condition; whoever terminates it answers with the `Fulfill`
//! preimage (derived from the payload hash, so termination needs no shared
//! session state) or a `Reject`. Every relayed Fulfill increments the
//! channel owed to the downstream peer, and crossing the settlement
//! threshold enqueues an asynchronous on-chain claim submission.
//!
//! # Modules
//!
//! - [`address`] — hierarchical destination addresses and prefix matching.
//! - [`chain`] — chain adapters behind the settlement seam.
//! - [`claim`] — signed channel claims (ed25519, domain-separated).
//! - [`codec`] — binary wire framing and the error-code registry.
//! - [`condition`] — the SHA-256 condition/fulfillment hash chain.
//! - [`config`] — node configuration, validation, and hardening checks.
//! - [`forwarder`] — the per-Prepare state machine.
//! - [`handler`] — local payload delivery (in-process or HTTP).
//! - [`http`] — health and admin surface.
//! - [`ledger`] — off-chain channel accounting and settlement triggers.
//! - [`node`] — orchestrator: lifecycle, health, graceful shutdown.
//! - [`routing`] — longest-prefix routing table.
//! - [`session`] — authenticated peer sessions with heartbeat and backoff.
//! - [`settlement`] — the settlement worker.

pub mod address;
pub mod chain;
pub mod claim;
pub mod codec;
pub mod condition;
pub mod config;
pub mod forwarder;
pub mod handler;
pub mod http;
pub mod ledger;
pub mod node;
pub mod routing;
pub mod session;
pub mod settlement;
pub mod timestamp;
pub mod types;
pub mod util;
