//! # dirnode-agreement
//!
//! Distributed commit-reveal agreement service for a fixed, mutually
//! known fleet of directory nodes. Each cycle every node commits to a
//! random secret, reveals it once all commitments are decided, and the
//! verified secrets are summed into a shared "common random" used
//! downstream as an anti-replay and synchronization token.
//!
//! The library exposes the protocol core ([`AgreementCoordinator`]), the
//! HTTP transport binding ([`network`]) and the directory seam
//! ([`directory`]); the node binary in `src/main.rs` wires them together.

pub mod agreement;
pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod network;

pub use agreement::commitment::{verify_commitment, Commitment};
pub use agreement::coordinator::{AgreementCoordinator, AgreementSink, Phase};
pub use agreement::message::{AgreementMessage, MessageKind, RoundId, Subphase};
pub use agreement::quorum::Quorum;
pub use agreement::scheduler::AgreementScheduler;
pub use config::{AgreementConfig, DEFAULT_COMMON_RANDOM};
pub use directory::{Directory, NodeId, StaticDirectory, Target};
pub use error::{ConfigError, TransportError};
pub use network::{start_server, HttpTransport, MessageTransport};
