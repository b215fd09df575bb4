//! Round instance
//!
//! One instance exists per running round identifier and bundles one
//! [`SingleDecreeExecution`] per round leader. It is superseded as a
//! whole on a round change; `seq` lets timer tasks that outlive an
//! instance detect that it has been replaced.

use crate::agreement::execution::SingleDecreeExecution;
use crate::agreement::message::RoundId;
use crate::directory::NodeId;
use std::collections::HashMap;

#[derive(Debug)]
pub struct RoundInstance {
    id: RoundId,
    seq: u64,
    executions: HashMap<NodeId, SingleDecreeExecution>,
    decisions: HashMap<NodeId, Option<String>>,
}

impl RoundInstance {
    /// Builds the instance with one execution per round leader.
    pub fn new(id: RoundId, seq: u64, leaders: &[NodeId]) -> Self {
        let executions = leaders
            .iter()
            .map(|leader| (leader.clone(), SingleDecreeExecution::new(leader.clone())))
            .collect();
        RoundInstance {
            id,
            seq,
            executions,
            decisions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &RoundId {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Size of the round's leader set.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn execution_mut(&mut self, initiator: &NodeId) -> Option<&mut SingleDecreeExecution> {
        self.executions.get_mut(initiator)
    }

    /// Records a decision for one execution. Returns true if this
    /// decision completed the round (every execution decided).
    pub fn add_decision(&mut self, initiator: NodeId, value: Option<String>) -> bool {
        self.decisions.insert(initiator, value);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.decisions.len() == self.executions.len()
    }

    pub fn decisions(&self) -> &HashMap<NodeId, Option<String>> {
        &self.decisions
    }

    /// Cancels every execution of this instance (round change).
    pub fn cancel_all(&mut self) {
        for execution in self.executions.values_mut() {
            execution.cancel();
        }
    }

    /// Decides every still-pending execution as "did not participate".
    /// Returns true if the round is complete afterwards.
    pub fn timeout_undecided(&mut self) -> bool {
        for execution in self.executions.values_mut() {
            if !execution.is_decided() && !execution.is_canceled() {
                execution.decide_timeout();
                self.decisions.insert(execution.initiator().clone(), None);
            }
        }
        self.is_complete()
    }
}
