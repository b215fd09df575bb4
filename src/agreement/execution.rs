//! Single-decree execution
//!
//! One execution runs per round leader and decides exactly one value:
//! the leader's proposal for the current round. It is driven purely by
//! inbound messages routed to it by the coordinator; votes it emits in
//! return are multicast by the coordinator.

use crate::agreement::message::{AgreementMessage, MessageKind};
use crate::agreement::quorum::Quorum;
use crate::directory::NodeId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What handling one message produced: votes to multicast (derived from
/// the handled message) and, at most once, the decided value.
#[derive(Debug, Default)]
pub struct Outcome {
    pub votes: Vec<MessageKind>,
    pub decided: Option<String>,
}

/// State of one agreement run between the local node and one round
/// leader's proposal.
#[derive(Debug)]
pub struct SingleDecreeExecution {
    initiator: NodeId,
    proposal: Option<String>,
    weak_votes: HashMap<String, HashSet<NodeId>>,
    strong_votes: HashMap<String, HashSet<NodeId>>,
    decide_votes: HashMap<String, HashSet<NodeId>>,
    weak_accepted: bool,
    strong_accepted: bool,
    decided: bool,
    canceled: bool,
}

impl SingleDecreeExecution {
    pub fn new(initiator: NodeId) -> Self {
        SingleDecreeExecution {
            initiator,
            proposal: None,
            weak_votes: HashMap::new(),
            strong_votes: HashMap::new(),
            decide_votes: HashMap::new(),
            weak_accepted: false,
            strong_accepted: false,
            decided: false,
            canceled: false,
        }
    }

    pub fn initiator(&self) -> &NodeId {
        &self.initiator
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Marks the execution canceled. Idempotent; canceled executions
    /// ignore all further input.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    /// Marks an undecided execution as decided without a value, used when
    /// the round times out.
    pub fn decide_timeout(&mut self) {
        self.decided = true;
    }

    /// Feeds one inbound message into the execution.
    pub fn handle(&mut self, msg: &AgreementMessage, quorum: Quorum) -> Outcome {
        let mut outcome = Outcome::default();
        if self.canceled {
            debug!(initiator = %self.initiator, "execution canceled, dropping message");
            return outcome;
        }
        let Some(proposal) = msg.proposal.clone() else {
            return outcome;
        };

        match msg.kind {
            MessageKind::Propose => {
                if self.proposal.is_none() {
                    self.proposal = Some(proposal.clone());
                    if !self.weak_accepted {
                        self.weak_accepted = true;
                        outcome.votes.push(MessageKind::Weak);
                    }
                }
            }
            MessageKind::Weak => {
                let count = add_vote(&mut self.weak_votes, &proposal, &msg.sender);
                if count > quorum.decide_weak() && !self.decided {
                    self.decide(&proposal, &mut outcome);
                }
                if count > quorum.strong() && !self.strong_accepted {
                    self.strong_accepted = true;
                    outcome.votes.push(MessageKind::Strong);
                }
                // f+1 weak votes mean at least one honest node weakly
                // accepted, so we may as well.
                if count > quorum.f() && !self.weak_accepted {
                    self.weak_accepted = true;
                    outcome.votes.push(MessageKind::Weak);
                }
            }
            MessageKind::Strong => {
                let count = add_vote(&mut self.strong_votes, &proposal, &msg.sender);
                if count > quorum.decide_strong() && !self.decided {
                    self.decide(&proposal, &mut outcome);
                }
            }
            MessageKind::Decide => {
                let count = add_vote(&mut self.decide_votes, &proposal, &msg.sender);
                if count > quorum.f() && !self.decided {
                    self.decide(&proposal, &mut outcome);
                }
            }
            MessageKind::Reject => {}
        }
        outcome
    }

    fn decide(&mut self, proposal: &str, outcome: &mut Outcome) {
        self.decided = true;
        outcome.decided = Some(proposal.to_string());
        outcome.votes.push(MessageKind::Decide);
    }
}

fn add_vote(votes: &mut HashMap<String, HashSet<NodeId>>, proposal: &str, sender: &NodeId) -> usize {
    let senders = votes.entry(proposal.to_string()).or_default();
    senders.insert(sender.clone());
    senders.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::message::RoundId;

    fn weak_from(sender: &str, proposal: &str) -> AgreementMessage {
        AgreementMessage {
            kind: MessageKind::Weak,
            instance: RoundId::commitment("r"),
            round: 0,
            initiator: "leader".to_string(),
            sender: sender.to_string(),
            proposal: Some(proposal.to_string()),
        }
    }

    #[test]
    fn test_propose_triggers_weak_accept() {
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        let propose = AgreementMessage::propose(
            RoundId::commitment("r"),
            "leader".to_string(),
            "value".to_string(),
        );
        let outcome = execution.handle(&propose, Quorum::new(4));
        assert_eq!(outcome.votes, vec![MessageKind::Weak]);
        assert!(outcome.decided.is_none());

        // A second proposal does not re-trigger anything.
        let outcome = execution.handle(&propose, Quorum::new(4));
        assert!(outcome.votes.is_empty());
    }

    #[test]
    fn test_four_weak_votes_fast_decide() {
        let quorum = Quorum::new(4);
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        for sender in ["a", "b", "c"] {
            let outcome = execution.handle(&weak_from(sender, "v"), quorum);
            assert!(outcome.decided.is_none());
        }
        let outcome = execution.handle(&weak_from("d", "v"), quorum);
        assert_eq!(outcome.decided.as_deref(), Some("v"));
        assert!(outcome.votes.contains(&MessageKind::Decide));
        assert!(execution.is_decided());
    }

    #[test]
    fn test_three_weak_votes_strong_accept() {
        let quorum = Quorum::new(4);
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        execution.handle(&weak_from("a", "v"), quorum);
        execution.handle(&weak_from("b", "v"), quorum);
        let outcome = execution.handle(&weak_from("c", "v"), quorum);
        assert!(outcome.votes.contains(&MessageKind::Strong));
        assert!(outcome.decided.is_none());
    }

    #[test]
    fn test_duplicate_votes_are_ignored() {
        let quorum = Quorum::new(4);
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        for _ in 0..5 {
            let outcome = execution.handle(&weak_from("a", "v"), quorum);
            assert!(outcome.decided.is_none());
        }
    }

    #[test]
    fn test_strong_votes_decide() {
        let quorum = Quorum::new(4);
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        let mut strong = weak_from("a", "v");
        strong.kind = MessageKind::Strong;
        execution.handle(&strong, quorum);
        strong.sender = "b".to_string();
        execution.handle(&strong, quorum);
        strong.sender = "c".to_string();
        let outcome = execution.handle(&strong, quorum);
        assert_eq!(outcome.decided.as_deref(), Some("v"));
    }

    #[test]
    fn test_canceled_execution_ignores_input() {
        let quorum = Quorum::new(4);
        let mut execution = SingleDecreeExecution::new("leader".to_string());
        execution.cancel();
        execution.cancel();
        for sender in ["a", "b", "c", "d"] {
            let outcome = execution.handle(&weak_from(sender, "v"), quorum);
            assert!(outcome.votes.is_empty());
            assert!(outcome.decided.is_none());
        }
        assert!(!execution.is_decided());
    }
}
