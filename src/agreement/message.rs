//! Protocol messages and round identifiers

use crate::directory::NodeId;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Wire suffix distinguishing the reveal sub-phase of a cycle from its
/// commitment sub-phase.
const REVEAL_SUFFIX: &str = "--r";

/// Which half of a cycle a round identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subphase {
    Commitment,
    Reveal,
}

/// Identifier of the currently running round.
///
/// The commitment and the reveal sub-phase of one cycle share a base
/// identifier (the previous cycle's common random) but are kept apart on
/// the wire by a fixed suffix. Peers may briefly be one sub-phase ahead,
/// so round acceptance ([`RoundId::accepts`]) only compares bases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundId {
    base: String,
    subphase: Subphase,
}

impl RoundId {
    pub fn commitment(base: impl Into<String>) -> Self {
        RoundId {
            base: base.into(),
            subphase: Subphase::Commitment,
        }
    }

    pub fn reveal(base: impl Into<String>) -> Self {
        RoundId {
            base: base.into(),
            subphase: Subphase::Reveal,
        }
    }

    /// The same cycle's reveal-phase identifier.
    pub fn reveal_of(&self) -> Self {
        RoundId::reveal(self.base.clone())
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn subphase(&self) -> Subphase {
        self.subphase
    }

    /// True if a message carrying `other` belongs to this cycle, i.e. the
    /// bases match regardless of sub-phase.
    pub fn accepts(&self, other: &RoundId) -> bool {
        self.base == other.base
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subphase {
            Subphase::Commitment => write!(f, "{}", self.base),
            Subphase::Reveal => write!(f, "{}{}", self.base, REVEAL_SUFFIX),
        }
    }
}

impl FromStr for RoundId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.strip_suffix(REVEAL_SUFFIX) {
            Some(base) => RoundId::reveal(base),
            None => RoundId::commitment(s),
        })
    }
}

impl Serialize for RoundId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoundId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Message kinds of the agreement protocol.
///
/// `Propose` opens an execution; `Weak`, `Strong` and `Decide` are the
/// acceptance votes of the single-decree primitive; `Reject` carries the
/// sender's round identifier back to a desynchronized peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Propose,
    Weak,
    Strong,
    Decide,
    Reject,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Propose => "PROPOSE",
            MessageKind::Weak => "WEAK",
            MessageKind::Strong => "STRONG",
            MessageKind::Decide => "DECIDE",
            MessageKind::Reject => "REJECT",
        };
        write!(f, "{}", name)
    }
}

/// One protocol message, serialized as a small signed document and POSTed
/// to the receiver's `/agreement` endpoint by the transport.
///
/// `proposal: None` is the "no usable value" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementMessage {
    #[serde(rename = "MessageType")]
    pub kind: MessageKind,
    #[serde(rename = "PaxosInstance")]
    pub instance: RoundId,
    #[serde(rename = "RoundNr")]
    pub round: u32,
    #[serde(rename = "Initiator")]
    pub initiator: NodeId,
    #[serde(rename = "Sender")]
    pub sender: NodeId,
    #[serde(rename = "Proposal")]
    pub proposal: Option<String>,
}

impl AgreementMessage {
    /// The first message of an execution: `sender` proposes `proposal`
    /// for its own execution.
    pub fn propose(instance: RoundId, sender: NodeId, proposal: String) -> Self {
        AgreementMessage {
            kind: MessageKind::Propose,
            instance,
            round: 0,
            initiator: sender.clone(),
            sender,
            proposal: Some(proposal),
        }
    }

    /// A vote derived from a received message, re-signed by `sender`.
    pub fn vote(kind: MessageKind, original: &AgreementMessage, sender: NodeId) -> Self {
        AgreementMessage {
            kind,
            instance: original.instance.clone(),
            round: original.round,
            initiator: original.initiator.clone(),
            sender,
            proposal: original.proposal.clone(),
        }
    }

    /// A reject answering `original`, carrying this node's round base.
    pub fn reject(original: &AgreementMessage, sender: NodeId, own_base: String) -> Self {
        AgreementMessage {
            kind: MessageKind::Reject,
            instance: original.instance.clone(),
            round: original.round,
            initiator: original.initiator.clone(),
            sender,
            proposal: Some(own_base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_id_wire_forms() {
        let commitment = RoundId::commitment("4711");
        let reveal = commitment.reveal_of();
        assert_eq!(commitment.to_string(), "4711");
        assert_eq!(reveal.to_string(), "4711--r");
        assert_eq!("4711".parse::<RoundId>().unwrap(), commitment);
        assert_eq!("4711--r".parse::<RoundId>().unwrap(), reveal);
    }

    #[test]
    fn test_round_acceptance_ignores_subphase() {
        let commitment = RoundId::commitment("4711");
        let reveal = RoundId::reveal("4711");
        let other = RoundId::commitment("0815");
        assert!(commitment.accepts(&reveal));
        assert!(reveal.accepts(&commitment));
        assert!(!commitment.accepts(&other));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = AgreementMessage::propose(
            RoundId::reveal("4711"),
            "node-a".to_string(),
            "12#34".to_string(),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["MessageType"], "PROPOSE");
        assert_eq!(json["PaxosInstance"], "4711--r");
        assert_eq!(json["RoundNr"], 0);
        assert_eq!(json["Initiator"], "node-a");
        assert_eq!(json["Sender"], "node-a");
        assert_eq!(json["Proposal"], "12#34");

        let back: AgreementMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_reject_carries_own_base() {
        let propose = AgreementMessage::propose(
            RoundId::commitment("theirs"),
            "node-b".to_string(),
            "hash".to_string(),
        );
        let reject = AgreementMessage::reject(&propose, "node-a".to_string(), "ours".to_string());
        assert_eq!(reject.kind, MessageKind::Reject);
        assert_eq!(reject.proposal.as_deref(), Some("ours"));
        assert_eq!(reject.instance, propose.instance);
        assert_eq!(reject.initiator, "node-b");
    }
}
