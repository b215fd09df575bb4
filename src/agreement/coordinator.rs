//! Agreement coordinator
//!
//! The protocol state machine and message router. One coordinator exists
//! per node process; it owns the current round identifier, the phase, the
//! per-cycle commitment, both holding queues and the active round
//! instance. Inbound messages, timer tasks and the scheduler all call
//! into it; every phase or round transition serializes on the state
//! mutex, and network sends as well as the agreement callback happen
//! strictly after the lock is released.

use crate::agreement::commitment::{secret_of, verify_commitment, Commitment};
use crate::agreement::instance::RoundInstance;
use crate::agreement::message::{AgreementMessage, MessageKind, RoundId};
use crate::agreement::quorum::Quorum;
use crate::agreement::scheduler::AgreementScheduler;
use crate::config::AgreementConfig;
use crate::directory::{Directory, NodeId, Target};
use crate::network::MessageTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Phases of one agreement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Inactive,
    Passive,
    Commitment,
    PhaseGap,
    Reveal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Inactive => "INACTIVE",
            Phase::Passive => "PASSIVE",
            Phase::Commitment => "COMMITMENT",
            Phase::PhaseGap => "PHASE_GAP",
            Phase::Reveal => "REVEAL",
        };
        write!(f, "{}", name)
    }
}

/// Consumer of a successfully agreed value, e.g. the directory layer that
/// stores it as the new shared round token.
pub trait AgreementSink: Send + Sync {
    fn use_agreement(&self, value: i64);
}

/// Everything the phase transitions guard. Exactly one instance, owned by
/// the coordinator.
struct CoordinatorState {
    phase: Phase,
    current_round: RoundId,
    own_commitment: Option<Commitment>,
    /// Commitment-phase decisions, kept for verifying the reveals.
    peer_commitments: HashMap<NodeId, Option<String>>,
    instance: Option<RoundInstance>,
    /// Leader-set snapshot taken at cycle start.
    targets: HashMap<NodeId, Target>,
    instance_seq: u64,
}

/// Side effects collected while the state lock is held and executed after
/// it is released.
#[derive(Default)]
struct Actions {
    outbound: Vec<AgreementMessage>,
    targets: HashMap<NodeId, Target>,
    deliver: Option<i64>,
    replay: Vec<AgreementMessage>,
}

pub struct AgreementCoordinator {
    id: NodeId,
    config: AgreementConfig,
    transport: Arc<dyn MessageTransport>,
    directory: Arc<dyn Directory>,
    sink: Arc<dyn AgreementSink>,
    state: Mutex<CoordinatorState>,
    passive_queue: Mutex<Vec<AgreementMessage>>,
    /// Messages deferred because their round identifier did not match;
    /// replayed after a successful round change.
    deferred_queue: Mutex<Vec<AgreementMessage>>,
    inbox: mpsc::UnboundedSender<AgreementMessage>,
    scheduler: Mutex<Option<AgreementScheduler>>,
    /// Set by [`start`](Self::start); a finished cycle only re-arms the
    /// scheduler when the node runs scheduler-driven.
    scheduler_enabled: AtomicBool,
    weak_self: Weak<AgreementCoordinator>,
}

impl AgreementCoordinator {
    /// Creates the coordinator and spawns its message dispatcher. Must be
    /// called within a Tokio runtime. The scheduler is not started until
    /// [`start`](Self::start).
    pub fn new(
        id: NodeId,
        config: AgreementConfig,
        transport: Arc<dyn MessageTransport>,
        directory: Arc<dyn Directory>,
        sink: Arc<dyn AgreementSink>,
    ) -> Arc<Self> {
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let bootstrap = RoundId::commitment(config.bootstrap_random.clone());
        let coordinator = Arc::new_cyclic(|weak| AgreementCoordinator {
            id,
            config,
            transport,
            directory,
            sink,
            state: Mutex::new(CoordinatorState {
                phase: Phase::Inactive,
                current_round: bootstrap,
                own_commitment: None,
                peer_commitments: HashMap::new(),
                instance: None,
                targets: HashMap::new(),
                instance_seq: 0,
            }),
            passive_queue: Mutex::new(Vec::new()),
            deferred_queue: Mutex::new(Vec::new()),
            inbox,
            scheduler: Mutex::new(None),
            scheduler_enabled: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&coordinator);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(this) = weak.upgrade() else { return };
                this.process(msg);
            }
        });
        coordinator
    }

    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn current_round(&self) -> RoundId {
        self.state.lock().current_round.clone()
    }

    /// Arms the scheduler for the next agreement time and keeps it
    /// re-armed after every finished cycle.
    pub fn start(&self) {
        self.scheduler_enabled.store(true, Ordering::Relaxed);
        self.start_scheduler();
    }

    /// Manually starts an agreement. Only usable while inactive; a no-op
    /// with a log message otherwise. Operational/testing aid.
    pub fn start_protocol_by_operator(&self) {
        {
            let state = self.state.lock();
            match state.phase {
                Phase::Commitment | Phase::PhaseGap | Phase::Reveal => {
                    info!("won't start the protocol, an agreement is running");
                    return;
                }
                Phase::Passive => {
                    info!("won't start the protocol, already passive and an agreement will start soon");
                    return;
                }
                Phase::Inactive => {}
            }
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.cancel();
        }
        info!("initializing agreement on operator request");
        self.start_passive_phase();
    }

    /// Aborts a running cycle and returns to INACTIVE.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            info!(phase = %state.phase, "aborting agreement");
            if let Some(instance) = state.instance.as_mut() {
                instance.cancel_all();
            }
            state.instance = None;
            state.own_commitment = None;
            state.peer_commitments = HashMap::new();
            state.phase = Phase::Inactive;
        }
        self.passive_queue.lock().clear();
        self.deferred_queue.lock().clear();
        self.start_scheduler();
    }

    /// Enters the passive phase: inbound messages are queued and handled
    /// once the commitment phase starts after the configured delay.
    pub fn start_passive_phase(&self) {
        {
            let mut state = self.state.lock();
            if matches!(
                state.phase,
                Phase::Commitment | Phase::PhaseGap | Phase::Reveal
            ) {
                debug!(phase = %state.phase, "agreement already running, not entering passive phase");
                return;
            }
            info!("starting passive phase");
            state.phase = Phase::Passive;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let wait = self.config.passive_phase;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            this.start_agreement();
        });
    }

    /// Entry point for the transport: routes one inbound message.
    /// Checks run in a fixed order; accepted messages are handed to the
    /// dispatcher task so a slow peer can never block this path.
    pub fn handle_incoming_message(&self, msg: AgreementMessage) {
        {
            let state = self.state.lock();
            match state.phase {
                Phase::Inactive => {
                    debug!(kind = %msg.kind, sender = %msg.sender, "inactive, dropping message");
                    return;
                }
                Phase::Passive | Phase::PhaseGap => {
                    debug!(kind = %msg.kind, sender = %msg.sender, "passive or phase gap, queueing message");
                    self.passive_queue.lock().push(msg);
                    return;
                }
                Phase::Commitment | Phase::Reveal => {}
            }

            if msg.kind != MessageKind::Reject {
                if !state.targets.contains_key(&msg.sender) {
                    debug!(sender = %msg.sender, "sender not in the round snapshot, dropping");
                    return;
                }
                if state.current_round.accepts(&msg.instance) {
                    let _ = self.inbox.send(msg);
                    return;
                }
                debug!(
                    instance = %msg.instance,
                    current = %state.current_round,
                    "round identifier not acceptable, deferring"
                );
                // Answer a mismatched proposal with our own round id so
                // the sender can run its round change. Never reject
                // yourself.
                let reply = if state.phase == Phase::Commitment
                    && msg.kind == MessageKind::Propose
                    && msg.sender != self.id
                {
                    state.targets.get(&msg.sender).map(|target| {
                        let own_base = state.current_round.base().to_string();
                        (
                            target.clone(),
                            AgreementMessage::reject(&msg, self.id.clone(), own_base),
                        )
                    })
                } else {
                    None
                };
                self.deferred_queue.lock().push(msg);
                drop(state);
                if let Some((target, reject)) = reply {
                    self.send_to(&target, reject);
                }
                return;
            }
        }
        // A reject means our round id may be stale: run the round change.
        self.notify_reject(msg.proposal);
    }

    /// Round-change protocol. Cancels the superseded instance, adopts the
    /// carried round id (or the bootstrap id if none was usable), rebuilds
    /// the instance, re-proposes the current phase's value and replays the
    /// deferred messages.
    pub fn notify_reject(&self, new_round: Option<String>) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Commitment | Phase::Reveal) {
                debug!(phase = %state.phase, "ignoring round change outside an active phase");
                return;
            }
            let base = match new_round {
                Some(round) => round,
                None => {
                    error!(
                        "reject carried no usable round id, resetting to the bootstrap round \
                         (irrecoverable desynchronization)"
                    );
                    self.config.bootstrap_random.clone()
                }
            };
            if state.current_round.base() == base {
                return;
            }
            if let Some(instance) = state.instance.as_mut() {
                instance.cancel_all();
            }
            info!(old = %state.current_round, new = %base, "round change accepted");
            state.current_round = match state.phase {
                Phase::Reveal => RoundId::reveal(base),
                _ => RoundId::commitment(base),
            };
            self.start_round_locked(&mut state);
            let proposal = match state.phase {
                // Peers already hold our commitment hash, so the reveal
                // value must stay the one we committed to.
                Phase::Reveal => state.own_commitment.as_ref().map(|c| c.reveal_string()),
                _ => {
                    let commitment = Commitment::generate();
                    let hash = commitment.commitment_string().to_string();
                    state.own_commitment = Some(commitment);
                    Some(hash)
                }
            };
            if let Some(proposal) = proposal {
                actions.outbound.push(AgreementMessage::propose(
                    state.current_round.clone(),
                    self.id.clone(),
                    proposal,
                ));
            }
            actions.targets = state.targets.clone();
        }
        actions.replay = std::mem::take(&mut *self.deferred_queue.lock());
        if !actions.replay.is_empty() {
            debug!(count = actions.replay.len(), "replaying deferred messages after round change");
        }
        self.run_actions(actions);
    }

    /// Passive timer elapsed: snapshot the leader set, open the
    /// commitment round and propose our commitment hash.
    fn start_agreement(&self) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Passive {
                debug!(phase = %state.phase, "passive timer elapsed but phase moved on");
                return;
            }
            info!("starting agreement");
            state.phase = Phase::Commitment;
            state.targets = self.directory.snapshot();
            if state.targets.is_empty() {
                error!("no known targets, cannot run an agreement");
                state.phase = Phase::Inactive;
                return;
            }
            self.start_round_locked(&mut state);
            let commitment = Commitment::generate();
            actions.outbound.push(AgreementMessage::propose(
                state.current_round.clone(),
                self.id.clone(),
                commitment.commitment_string().to_string(),
            ));
            state.own_commitment = Some(commitment);
            actions.targets = state.targets.clone();
        }
        actions.replay = self.drain_passive_queue();
        self.run_actions(actions);
    }

    /// Phase-gap timer elapsed: open the reveal round under the suffixed
    /// id and propose the reveal text.
    fn enter_reveal_phase(&self) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            if state.phase != Phase::PhaseGap {
                debug!(phase = %state.phase, "gap timer elapsed but phase moved on");
                return;
            }
            info!("starting reveal phase");
            state.phase = Phase::Reveal;
            self.start_round_locked(&mut state);
            let Some(commitment) = state.own_commitment.as_ref() else {
                error!("no own commitment at reveal start, aborting cycle");
                state.phase = Phase::Inactive;
                return;
            };
            actions.outbound.push(AgreementMessage::propose(
                state.current_round.clone(),
                self.id.clone(),
                commitment.reveal_string(),
            ));
            actions.targets = state.targets.clone();
        }
        actions.replay = self.drain_passive_queue();
        self.run_actions(actions);
    }

    /// Dispatcher body: feeds one accepted message into the matching
    /// execution of the active instance.
    fn process(&self, msg: AgreementMessage) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let completed = {
                let Some(instance) = state.instance.as_mut() else {
                    warn!(instance = %msg.instance, "no active round instance, dropping message");
                    return;
                };
                if instance.id() != &msg.instance {
                    warn!(
                        instance = %msg.instance,
                        active = %instance.id(),
                        "message does not belong to the active round instance, dropping"
                    );
                    return;
                }
                let quorum = Quorum::new(instance.len());
                let Some(execution) = instance.execution_mut(&msg.initiator) else {
                    debug!(initiator = %msg.initiator, "no execution for initiator, dropping");
                    return;
                };
                let outcome = execution.handle(&msg, quorum);
                for kind in outcome.votes {
                    actions
                        .outbound
                        .push(AgreementMessage::vote(kind, &msg, self.id.clone()));
                }
                match outcome.decided {
                    Some(value) => {
                        info!(initiator = %msg.initiator, value = %value, "decided");
                        instance.add_decision(msg.initiator.clone(), Some(value))
                    }
                    None => false,
                }
            };
            if completed {
                self.notify_agreement_locked(&mut state, &mut actions);
            }
            if !actions.outbound.is_empty() {
                actions.targets = state.targets.clone();
            }
        }
        self.run_actions(actions);
    }

    /// Every execution of the active instance decided. In the commitment
    /// phase this stores the peers' commitments and schedules the reveal;
    /// in the reveal phase it combines the reveals into the cycle result.
    fn notify_agreement_locked(&self, state: &mut CoordinatorState, actions: &mut Actions) {
        self.deferred_queue.lock().clear();
        let decisions = state
            .instance
            .as_ref()
            .map(|instance| instance.decisions().clone())
            .unwrap_or_default();

        match state.phase {
            Phase::Commitment => {
                info!("commitment phase complete, waiting for the reveal phase");
                state.phase = Phase::PhaseGap;
                state.peer_commitments = decisions;
                state.current_round = state.current_round.reveal_of();
                let Some(this) = self.weak_self.upgrade() else {
                    return;
                };
                let gap = self.config.phase_gap;
                tokio::spawn(async move {
                    tokio::time::sleep(gap).await;
                    this.enter_reveal_phase();
                });
            }
            Phase::Reveal => {
                let (value, verified) = combine(&state.peer_commitments, &decisions);
                let quorum = Quorum::new(state.targets.len());
                let need_restart = state.current_round.base() == self.config.bootstrap_random;
                info!(value, verified, "reveal phase complete");

                let next_base = if need_restart {
                    // An attacker could force repeated cycles under the
                    // well-known bootstrap id to predict or replay the
                    // outcome, so this result is never used.
                    warn!("cycle ran under the bootstrap round id, discarding result and restarting");
                    Some(value.to_string())
                } else if verified >= quorum.two_thirds() {
                    actions.deliver = Some(value);
                    Some(value.to_string())
                } else {
                    info!(
                        verified,
                        required = quorum.two_thirds(),
                        "too few verified reveals, discarding the cycle's value"
                    );
                    None
                };
                let Some(this) = self.weak_self.upgrade() else {
                    return;
                };
                let settle = self.config.phase_gap;
                tokio::spawn(async move {
                    tokio::time::sleep(settle).await;
                    this.finish_cycle(next_base, need_restart);
                });
            }
            other => warn!(phase = %other, "round completed in unexpected phase"),
        }
    }

    /// Settle timer elapsed: adopt the next round base and either restart
    /// immediately (replay guard) or go back to INACTIVE and reschedule.
    fn finish_cycle(&self, next_base: Option<String>, need_restart: bool) {
        {
            let mut state = self.state.lock();
            let base = next_base.unwrap_or_else(|| state.current_round.base().to_string());
            state.current_round = RoundId::commitment(base);
            state.own_commitment = None;
            state.peer_commitments = HashMap::new();
            state.instance = None;
            state.phase = Phase::Inactive;
        }
        if need_restart {
            self.start_passive_phase();
        } else {
            self.start_scheduler();
            info!("ready to start a new agreement");
        }
    }

    /// Builds a fresh instance for the current round id, one execution
    /// per round leader, and arms the round timeout.
    fn start_round_locked(&self, state: &mut CoordinatorState) {
        state.instance_seq += 1;
        let seq = state.instance_seq;
        let mut leaders: Vec<NodeId> = state.targets.keys().cloned().collect();
        leaders.sort();
        debug!(round = %state.current_round, leaders = leaders.len(), "starting round");
        state.instance = Some(RoundInstance::new(state.current_round.clone(), seq, &leaders));

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        // The first (and only) round also has to absorb peers that are
        // still in their passive phase.
        let timeout = self.config.passive_phase + self.config.round_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.instance_timeout(seq);
        });
    }

    /// Round timeout: decide every pending execution as "did not
    /// participate" so the phase can complete.
    fn instance_timeout(&self, seq: u64) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let complete = {
                let Some(instance) = state.instance.as_mut() else {
                    return;
                };
                if instance.seq() != seq || instance.is_complete() {
                    return;
                }
                warn!(round = %instance.id(), "round timed out, closing pending executions");
                instance.timeout_undecided()
            };
            if complete {
                self.notify_agreement_locked(&mut state, &mut actions);
            }
        }
        self.run_actions(actions);
    }

    fn drain_passive_queue(&self) -> Vec<AgreementMessage> {
        let queued = std::mem::take(&mut *self.passive_queue.lock());
        if !queued.is_empty() {
            info!(count = queued.len(), "handling passively received messages");
        }
        queued
    }

    fn run_actions(&self, actions: Actions) {
        for msg in actions.outbound {
            self.multicast(&actions.targets, msg);
        }
        if let Some(value) = actions.deliver {
            info!(value, "agreement reached");
            self.sink.use_agreement(value);
        }
        for msg in actions.replay {
            self.handle_incoming_message(msg);
        }
    }

    fn multicast(&self, targets: &HashMap<NodeId, Target>, msg: AgreementMessage) {
        for target in targets.values() {
            self.send_to(target, msg.clone());
        }
    }

    fn send_to(&self, target: &Target, msg: AgreementMessage) {
        let transport = self.transport.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.send(&target, &msg).await {
                warn!(peer = %target.id, %error, "failed to deliver message");
            }
        });
    }

    fn start_scheduler(&self) {
        if !self.scheduler_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let scheduler = AgreementScheduler::start(
            this,
            self.config.poll_interval,
            self.config.agreement_divisor,
        );
        if let Some(old) = self.scheduler.lock().replace(scheduler) {
            old.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_round(&self, base: &str) {
        self.state.lock().current_round = RoundId::commitment(base);
    }

    #[cfg(test)]
    pub(crate) fn own_secret(&self) -> Option<i64> {
        self.state.lock().own_commitment.as_ref().map(|c| c.secret())
    }

    #[cfg(test)]
    pub(crate) fn instance_seq(&self) -> u64 {
        self.state.lock().instance_seq
    }

    #[cfg(test)]
    pub(crate) fn queued_passive(&self) -> Vec<AgreementMessage> {
        self.passive_queue.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred_queue.lock().len()
    }
}

/// Combines the reveal-phase decisions: every reveal that matches its
/// stored commitment contributes its secret to the wrapping sum. Returns
/// the sum and the number of verified contributors.
fn combine(
    commitments: &HashMap<NodeId, Option<String>>,
    reveals: &HashMap<NodeId, Option<String>>,
) -> (i64, usize) {
    let mut value: i64 = 0;
    let mut verified = 0;
    for (node, reveal) in reveals {
        let Some(reveal) = reveal else {
            debug!(%node, "no reveal from this node");
            continue;
        };
        let Some(Some(hash)) = commitments.get(node) else {
            debug!(%node, "reveal without a stored commitment, excluding");
            continue;
        };
        if !verify_commitment(hash, reveal) {
            warn!(%node, "reveal does not match the stored commitment, excluding");
            continue;
        }
        let Some(secret) = secret_of(reveal) else {
            warn!(%node, "verified reveal carries no parsable secret, excluding");
            continue;
        };
        debug!(%node, secret, "contribution verified");
        value = value.wrapping_add(secret);
        verified += 1;
    }
    (value, verified)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(commitment: &Commitment) -> (Option<String>, Option<String>) {
        (
            Some(commitment.commitment_string().to_string()),
            Some(commitment.reveal_string()),
        )
    }

    fn fixtures(secrets: &[i64]) -> (HashMap<NodeId, Option<String>>, HashMap<NodeId, Option<String>>) {
        let mut commitments = HashMap::new();
        let mut reveals = HashMap::new();
        for (i, secret) in secrets.iter().enumerate() {
            let node = format!("node-{}", i);
            let (hash, reveal) = entry(&Commitment::new(*secret));
            commitments.insert(node.clone(), hash);
            reveals.insert(node, reveal);
        }
        (commitments, reveals)
    }

    #[test]
    fn test_combine_sums_verified_secrets() {
        let (commitments, reveals) = fixtures(&[10, 20, 30, 40]);
        assert_eq!(combine(&commitments, &reveals), (100, 4));
        assert_eq!(Quorum::new(4).two_thirds(), 3);
    }

    #[test]
    fn test_combine_excludes_corrupted_reveal() {
        let (commitments, mut reveals) = fixtures(&[10, 20, 30, 40]);
        // node-3's reveal no longer matches its commitment.
        reveals.insert("node-3".to_string(), Some("41#forged".to_string()));
        let (value, verified) = combine(&commitments, &reveals);
        assert_eq!((value, verified), (60, 3));
        assert!(verified >= Quorum::new(4).two_thirds());
    }

    #[test]
    fn test_combine_skips_missing_reveals() {
        let (commitments, mut reveals) = fixtures(&[10, 20, 30]);
        reveals.insert("node-2".to_string(), None);
        assert_eq!(combine(&commitments, &reveals), (30, 2));
    }

    #[test]
    fn test_combine_skips_reveal_without_commitment() {
        let (mut commitments, reveals) = fixtures(&[10, 20]);
        commitments.remove("node-1");
        assert_eq!(combine(&commitments, &reveals), (10, 1));
    }

    #[test]
    fn test_combine_wraps_on_overflow() {
        let (commitments, reveals) = fixtures(&[i64::MAX, 1]);
        let (value, verified) = combine(&commitments, &reveals);
        assert_eq!(verified, 2);
        assert_eq!(value, i64::MAX.wrapping_add(1));
    }
}
