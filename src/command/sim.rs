//! # SimRuntime: reference in-memory command runtime.
//!
//! Executes sealed [`Command`]s without a real-time controller: atomic
//! commands finish when told to (test hooks), wait commands finish on a
//! timer, transactions start/stop/cancel members from their condition
//! wiring. Watchers, error rules, condition overrides and status taps behave
//! as a real substrate would, which makes this runtime the reference
//! implementation for tests and demos.
//!
//! ## Driver model
//! Each loaded command gets one spawned driver task owning the node tree.
//! The driver recomputes derived states to a fixpoint whenever something
//! changed (external hook, signal, timer, cancellation), fires watcher
//! effects on edges, and publishes the root status on the handle.
//!
//! ## Rules
//! - Only sealed commands are accepted.
//! - `load_after` starts the successor at the predecessor's termination, or
//!   earlier at its takeover-allowed signal (gracefully stopping it).
//! - Cancellation reaches started members only; members that never started
//!   stay unstarted (unless flagged `start_during_cancel`).
//! - A cancelled command winds down and terminates **without** an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::command::{
    Command, CommandKind, ErrorRule, StatusTap, Watcher,
};
use crate::command::condition::{CommandId, Condition, SignalId, StateKind};
use crate::command::runtime::{CommandHandle, CommandRuntime, CommandStatus};
use crate::error::{ActivityError, RtError};

/// Reference in-memory runtime.
pub struct SimRuntime {
    inner: Arc<SimInner>,
}

struct SimInner {
    loads: broadcast::Sender<CommandId>,
    /// Every node id of a live execution maps to its shared control block.
    executions: Mutex<HashMap<CommandId, Arc<ExecShared>>>,
    signals: Mutex<HashMap<SignalId, bool>>,
    signal_seq: AtomicU64,
    /// Wakers of live executions; signal changes notify all of them.
    wakers: Mutex<Vec<Weak<Notify>>>,
}

/// Shared control block of one execution, reachable from runtime hooks.
struct ExecShared {
    notify: Arc<Notify>,
    /// External per-node inputs (test hooks / device feedback).
    external: Mutex<HashMap<CommandId, External>>,
    cancel: CancellationToken,
    /// Graceful-stop request (takeover hand-off).
    stop: AtomicBool,
    status_tx: watch::Sender<CommandStatus>,
    takeover_tx: watch::Sender<bool>,
}

#[derive(Default, Clone)]
struct External {
    complete: bool,
    takeover: bool,
    error: Option<RtError>,
}

/// A free boolean signal owned by the runtime, usable in [`Condition`]s.
#[derive(Clone)]
pub struct Signal {
    id: SignalId,
    inner: Weak<SimInner>,
}

impl Signal {
    /// The condition observing this signal.
    pub fn condition(&self) -> Condition {
        Condition::Signal(self.id)
    }

    /// Sets the signal value and wakes all executions.
    pub fn set(&self, value: bool) {
        if let Some(inner) = self.inner.upgrade() {
            let changed = {
                let mut signals = inner.signals.lock().expect("signal lock");
                let slot = signals.entry(self.id).or_insert(false);
                let changed = *slot != value;
                *slot = value;
                changed
            };
            if changed {
                inner.wake_all();
            }
        }
    }
}

impl SimRuntime {
    /// Creates a new runtime.
    pub fn new() -> Arc<Self> {
        let (loads, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: Arc::new(SimInner {
                loads,
                executions: Mutex::new(HashMap::new()),
                signals: Mutex::new(HashMap::new()),
                signal_seq: AtomicU64::new(1),
                wakers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Creates a free boolean signal with the given initial value.
    pub fn signal(&self, initial: bool) -> Signal {
        let id = SignalId(self.inner.signal_seq.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner
            .signals
            .lock()
            .expect("signal lock")
            .insert(id, initial);
        Signal {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Marks an atomic command node as having reached its goal.
    pub fn complete(&self, command: CommandId) {
        self.with_external(command, |ext| ext.complete = true);
    }

    /// Fails an atomic command node with the given error.
    pub fn fail(&self, command: CommandId, error: RtError) {
        self.with_external(command, |ext| ext.error = Some(error));
    }

    /// Raises the takeover-allowed state of a command node.
    pub fn allow_takeover(&self, command: CommandId) {
        self.with_external(command, |ext| ext.takeover = true);
    }

    /// Announces a command id as loaded without going through the scheduler
    /// (simulates out-of-band execution for defensive-consistency tests).
    pub fn announce_external_load(&self, command: CommandId) {
        let _ = self.inner.loads.send(command);
    }

    fn with_external(&self, command: CommandId, f: impl FnOnce(&mut External)) {
        let shared = {
            let map = self.inner.executions.lock().expect("executions lock");
            map.get(&command).cloned()
        };
        if let Some(shared) = shared {
            {
                let mut ext = shared.external.lock().expect("external lock");
                f(ext.entry(command).or_default());
            }
            shared.notify.notify_one();
        }
    }

    async fn load_inner(
        &self,
        command: Command,
        after: Option<&CommandHandle>,
    ) -> Result<CommandHandle, ActivityError> {
        if !command.is_sealed() {
            return Err(ActivityError::Rejected {
                reason: "command is not sealed".into(),
            });
        }
        let root_id = command.id();
        let (status_tx, status_rx) = watch::channel(CommandStatus::Ready);
        let (takeover_tx, _) = watch::channel(false);
        let cancel = CancellationToken::new();
        let shared = Arc::new(ExecShared {
            notify: Arc::new(Notify::new()),
            external: Mutex::new(HashMap::new()),
            cancel: cancel.clone(),
            stop: AtomicBool::new(false),
            status_tx,
            takeover_tx,
        });

        let mut nodes = Vec::new();
        flatten(command, None, &mut nodes);
        let ids: Vec<CommandId> = nodes.iter().map(|n| n.id).collect();
        {
            let mut map = self.inner.executions.lock().expect("executions lock");
            for id in &ids {
                map.insert(*id, Arc::clone(&shared));
            }
        }
        self.inner
            .wakers
            .lock()
            .expect("wakers lock")
            .push(Arc::downgrade(&shared.notify));

        // Predecessor wiring for chained starts.
        let pred = after.map(|h| {
            let pred_shared = self
                .inner
                .executions
                .lock()
                .expect("executions lock")
                .get(&h.command())
                .cloned();
            (h.clone(), pred_shared)
        });

        let driver = Driver {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&shared),
            nodes,
            states: Vec::new(),
            watch_edges: Vec::new(),
            raise_edges: Vec::new(),
            ids,
        };
        tokio::spawn(driver.run(pred));

        let _ = self.inner.loads.send(root_id);
        Ok(CommandHandle::new(root_id, status_rx, cancel))
    }
}

impl SimInner {
    fn wake_all(&self) {
        let mut wakers = self.wakers.lock().expect("wakers lock");
        wakers.retain(|w| match w.upgrade() {
            Some(n) => {
                n.notify_one();
                true
            }
            None => false,
        });
    }
}

#[async_trait]
impl CommandRuntime for SimRuntime {
    async fn load(&self, command: Command) -> Result<CommandHandle, ActivityError> {
        self.load_inner(command, None).await
    }

    async fn load_after(
        &self,
        command: Command,
        after: &CommandHandle,
    ) -> Result<CommandHandle, ActivityError> {
        self.load_inner(command, Some(after)).await
    }

    fn observe_loads(&self) -> broadcast::Receiver<CommandId> {
        self.inner.loads.subscribe()
    }
}

impl SimRuntime {
    /// See [`CommandRuntime::observe_loads`].
    pub fn loads(&self) -> broadcast::Receiver<CommandId> {
        self.inner.loads.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Node tree
// ---------------------------------------------------------------------------

struct MemberWiring {
    auto_start: bool,
    start_when: Option<Condition>,
    stop_when: Option<Condition>,
    cancel_when: Option<Condition>,
    start_during_cancel: bool,
    /// Latched true once the member's start was permanently suppressed.
    suppressed: bool,
    start_latched: bool,
}

enum NodeKind {
    Atomic,
    Wait(Option<Duration>),
    Transaction { children: Vec<usize> },
}

struct Node {
    id: CommandId,
    kind: NodeKind,
    wiring: Option<MemberWiring>,
    watchers: Vec<Watcher>,
    error_rules: Vec<ErrorRule>,
    cancel_when: Condition,
    stop_when: Condition,
    done_override: Option<Condition>,
    takeover_override: Option<Condition>,
    tap: Option<StatusTap>,
}

#[derive(Default)]
struct NodeState {
    started: bool,
    completed: bool,
    done: bool,
    cancelling: bool,
    takeover: bool,
    error: Option<RtError>,
    /// Child errors already folded into this node.
    error_consumed: bool,
    tapped_ready: bool,
    tapped_running: bool,
    tapped_final: bool,
    deadline: Option<Instant>,
}

impl NodeState {
    fn active(&self) -> bool {
        self.started && !self.done && self.error.is_none()
    }

    fn finished(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Flattens the command tree into `nodes`, returning the node index.
fn flatten(command: Command, wiring: Option<MemberWiring>, nodes: &mut Vec<Node>) -> usize {
    // Reserve the slot so parents precede children in index order.
    let index = nodes.len();
    nodes.push(Node {
        id: command.id(),
        kind: NodeKind::Atomic,
        wiring,
        watchers: command.watchers().to_vec(),
        error_rules: command.error_rules().to_vec(),
        cancel_when: command.cancel_condition().clone(),
        stop_when: command.stop_condition().clone(),
        done_override: command.done_override().cloned(),
        takeover_override: command.takeover_override().cloned(),
        tap: command.status_tap().cloned(),
    });

    // `Command` has no public destructuring; rebuild the kind from it.
    let kind = match command.into_kind() {
        CommandKind::Atomic => NodeKind::Atomic,
        CommandKind::Wait { duration } => NodeKind::Wait(duration),
        CommandKind::Transaction { members } => {
            let mut children = Vec::with_capacity(members.len());
            for member in members {
                let wiring = MemberWiring {
                    auto_start: member.auto_start,
                    start_when: member.start_when,
                    stop_when: member.stop_when,
                    cancel_when: member.cancel_when,
                    start_during_cancel: member.start_during_cancel,
                    suppressed: false,
                    start_latched: false,
                };
                children.push(flatten(member.command, Some(wiring), nodes));
            }
            NodeKind::Transaction { children }
        }
    };
    nodes[index].kind = kind;
    index
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    inner: Arc<SimInner>,
    shared: Arc<ExecShared>,
    nodes: Vec<Node>,
    states: Vec<NodeState>,
    /// Previous value per (node, watcher) for edge detection; Once latches.
    watch_edges: Vec<Vec<(bool, bool)>>,
    /// Previous value per (node, raise-rule) for edge detection.
    raise_edges: Vec<Vec<bool>>,
    ids: Vec<CommandId>,
}

impl Driver {
    async fn run(mut self, pred: Option<(CommandHandle, Option<Arc<ExecShared>>)>) {
        self.states = self.nodes.iter().map(|_| NodeState::default()).collect();
        self.watch_edges = self
            .nodes
            .iter()
            .map(|n| n.watchers.iter().map(|_| (false, false)).collect())
            .collect();
        self.raise_edges = self
            .nodes
            .iter()
            .map(|n| n.error_rules.iter().map(|_| false).collect())
            .collect();

        // READY taps fire at load for every node: composite members observe
        // admission before execution starts.
        for i in 0..self.nodes.len() {
            self.tap_ready(i);
        }

        let mut cancelled_before_start = false;
        if let Some((handle, pred_shared)) = pred {
            cancelled_before_start = !self.await_predecessor(handle, pred_shared).await;
        }
        if cancelled_before_start {
            // Never ran; wind down without an error.
            for i in 0..self.nodes.len() {
                self.states[i].done = true;
            }
            self.flush_taps();
            let _ = self.shared.status_tx.send(CommandStatus::Terminated { error: None });
            self.unregister();
            return;
        }

        self.start_node(0);
        let _ = self.shared.status_tx.send(CommandStatus::Running);

        loop {
            self.recompute();
            self.flush_taps();
            let _ = self
                .shared
                .takeover_tx
                .send(self.state_of(0, StateKind::TakeoverAllowed));

            if self.states[0].finished() {
                break;
            }

            let deadline = self
                .states
                .iter()
                .filter(|s| s.active())
                .filter_map(|s| s.deadline)
                .min();
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.cancel.cancelled(), if !self.states[0].cancelling => {
                    self.states[0].cancelling = true;
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {}
            }
        }

        // Unloading the execution terminates every remaining node; members
        // that never started observe TERMINATED straight from READY.
        for state in &mut self.states {
            if !state.finished() {
                state.done = true;
            }
        }
        self.flush_taps();

        let error = self.states[0].error.clone();
        let _ = self.shared.status_tx.send(CommandStatus::Terminated { error });
        self.unregister();
    }

    /// Waits for the predecessor to terminate or to allow takeover (stopping
    /// it gracefully in that case). Returns false if cancelled while waiting.
    async fn await_predecessor(
        &self,
        handle: CommandHandle,
        pred_shared: Option<Arc<ExecShared>>,
    ) -> bool {
        let mut status = handle.watch_status();
        if status.borrow().is_final() {
            return true;
        }
        let mut takeover = pred_shared.as_ref().map(|s| s.takeover_tx.subscribe());
        loop {
            let takeover_changed = async {
                match takeover.as_mut() {
                    Some(rx) => {
                        let _ = rx.wait_for(|allowed| *allowed).await;
                    }
                    // Predecessor already gone from the registry.
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() || status.borrow().is_final() {
                        return true;
                    }
                }
                _ = takeover_changed => {
                    if let Some(s) = pred_shared.as_ref() {
                        s.stop.store(true, AtomicOrdering::SeqCst);
                        s.notify.notify_one();
                    }
                    // Hand-off granted; start without waiting for termination.
                    return true;
                }
                _ = self.shared.cancel.cancelled() => return false,
            }
        }
    }

    fn unregister(&self) {
        let mut map = self.inner.executions.lock().expect("executions lock");
        for id in &self.ids {
            map.remove(id);
        }
    }

    fn start_node(&mut self, index: usize) {
        if self.states[index].started {
            return;
        }
        self.states[index].started = true;
        match &self.nodes[index].kind {
            NodeKind::Atomic => {}
            NodeKind::Wait(duration) => match duration {
                Some(d) => self.states[index].deadline = Some(Instant::now() + *d),
                None => {
                    self.states[index].completed = true;
                    self.states[index].done = true;
                }
            },
            NodeKind::Transaction { children } => {
                for child in children.clone() {
                    let auto = self.nodes[child]
                        .wiring
                        .as_ref()
                        .map(|w| w.auto_start)
                        .unwrap_or(false);
                    if auto {
                        self.start_node(child);
                    }
                }
            }
        }
    }

    fn state_of(&self, index: usize, kind: StateKind) -> bool {
        let s = &self.states[index];
        match kind {
            StateKind::Started => s.started,
            StateKind::Active => s.active(),
            StateKind::Completed => s.completed,
            StateKind::Done => s.done,
            StateKind::Cancelling => s.cancelling,
            StateKind::TakeoverAllowed => s.takeover,
        }
    }

    fn eval(&self, cond: &Condition) -> bool {
        let index_of: HashMap<CommandId, usize> = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let states = |cmd: CommandId, kind: StateKind| {
            index_of
                .get(&cmd)
                .map(|i| self.state_of(*i, kind))
                .unwrap_or(false)
        };
        let signals = |id: SignalId| {
            self.inner
                .signals
                .lock()
                .expect("signal lock")
                .get(&id)
                .copied()
                .unwrap_or(false)
        };
        cond.eval(&states, &signals)
    }

    /// Recomputes derived node states to a fixpoint.
    fn recompute(&mut self) {
        for _ in 0..64 {
            if !self.step() {
                break;
            }
        }
        self.fire_watchers();
    }

    /// One recompute pass; returns true if anything changed.
    fn step(&mut self) -> bool {
        let mut changed = false;

        // External inputs.
        let external: HashMap<CommandId, External> = self
            .shared
            .external
            .lock()
            .expect("external lock")
            .clone();
        let stop_requested = self.shared.stop.load(AtomicOrdering::SeqCst);

        for i in 0..self.nodes.len() {
            // Declared raises fire first (declaration order).
            for (r, rule) in self.nodes[i].error_rules.clone().iter().enumerate() {
                if let ErrorRule::Raise { when, error } = rule {
                    let now = self.eval(when);
                    let prev = self.raise_edges[i][r];
                    self.raise_edges[i][r] = now;
                    if now && !prev && !self.states[i].finished() {
                        self.states[i].error = Some(error.clone());
                        changed = true;
                    }
                }
            }

            // Cancel condition of the node itself.
            if !self.states[i].cancelling
                && !self.states[i].finished()
                && self.eval(&self.nodes[i].cancel_when.clone())
            {
                self.states[i].cancelling = true;
                changed = true;
            }

            // Graceful stop condition (node-level), and root stop requests.
            let stop = (i == 0 && stop_requested)
                || (self.states[i].started
                    && !self.states[i].finished()
                    && self.eval(&self.nodes[i].stop_when.clone()));

            match &self.nodes[i].kind {
                NodeKind::Atomic => {
                    let ext = external.get(&self.ids[i]).cloned().unwrap_or_default();
                    let s = &mut self.states[i];
                    if s.started && !s.finished() {
                        if let Some(err) = ext.error {
                            s.error = Some(err);
                            changed = true;
                        } else if ext.complete {
                            s.completed = true;
                            s.done = true;
                            changed = true;
                        } else if stop || s.cancelling {
                            // Winds down; done without reaching the goal.
                            s.done = true;
                            changed = true;
                        }
                    }
                    let takeover = s.active() && ext.takeover;
                    if s.takeover != takeover {
                        s.takeover = takeover;
                        changed = true;
                    }
                }
                NodeKind::Wait(_) => {
                    let s = &mut self.states[i];
                    if s.started && !s.finished() {
                        let expired = s
                            .deadline
                            .map(|d| Instant::now() >= d)
                            .unwrap_or(false);
                        if expired {
                            s.completed = true;
                            s.done = true;
                            changed = true;
                        } else if stop || s.cancelling {
                            s.done = true;
                            changed = true;
                        }
                    }
                }
                NodeKind::Transaction { children } => {
                    let children = children.clone();
                    changed |= self.step_transaction(i, &children, stop);
                }
            }

            // Apply ignore/map rules to a fresh node error.
            if let Some(err) = self.states[i].error.clone() {
                if !self.states[i].error_consumed {
                    self.states[i].error_consumed = true;
                    match apply_rules(&self.nodes[i].error_rules, err) {
                        Some(mapped) => self.states[i].error = Some(mapped),
                        None => {
                            // Ignored: finishes as if completed.
                            let s = &mut self.states[i];
                            s.error = None;
                            s.completed = true;
                            s.done = true;
                        }
                    }
                    changed = true;
                }
            }
        }
        changed
    }

    fn step_transaction(&mut self, index: usize, children: &[usize], stop: bool) -> bool {
        let mut changed = false;
        if !self.states[index].started || self.states[index].finished() {
            return false;
        }

        let cancelling = self.states[index].cancelling;

        // Member starts (edge-latched) and per-member stop/cancel wiring.
        for &child in children {
            let (start, member_stop, member_cancel) = {
                let node = &self.nodes[child];
                let Some(w) = node.wiring.as_ref() else { continue };
                let started = self.states[child].started;
                let mut start = false;
                if !started && !w.suppressed && !w.start_latched {
                    if let Some(cond) = &w.start_when {
                        if self.eval(cond) && (!cancelling || w.start_during_cancel) {
                            start = true;
                        }
                    }
                }
                let member_stop = started
                    && !self.states[child].finished()
                    && w.stop_when.as_ref().map(|c| self.eval(c)).unwrap_or(false);
                let member_cancel = started
                    && !self.states[child].finished()
                    && w.cancel_when
                        .as_ref()
                        .map(|c| self.eval(c))
                        .unwrap_or(false);
                (start, member_stop, member_cancel)
            };

            if start {
                if let Some(w) = self.nodes[child].wiring.as_mut() {
                    w.start_latched = true;
                }
                self.start_node(child);
                changed = true;
            }
            if member_stop && !self.states[child].done {
                self.states[child].completed = true;
                self.states[child].done = true;
                changed = true;
            }
            if member_cancel && !self.states[child].cancelling {
                self.states[child].cancelling = true;
                changed = true;
            }
        }

        // Cancellation propagates to started members only; unstarted members
        // are suppressed unless explicitly allowed to start during cancel.
        if cancelling {
            for &child in children {
                let during_cancel = self.nodes[child]
                    .wiring
                    .as_ref()
                    .map(|w| w.start_during_cancel)
                    .unwrap_or(false);
                if self.states[child].started {
                    // Members allowed to start during cancel (cancel handlers)
                    // run to completion; everything else winds down.
                    if !during_cancel
                        && self.states[child].active()
                        && !self.states[child].cancelling
                    {
                        self.states[child].cancelling = true;
                        changed = true;
                    }
                } else if let Some(w) = self.nodes[child].wiring.as_mut() {
                    if !w.start_during_cancel && !w.suppressed {
                        w.suppressed = true;
                        changed = true;
                    }
                }
            }
        }

        // Collect member errors (aggregated when several fail together).
        let mut member_errors: Vec<RtError> = Vec::new();
        for &child in children {
            if let Some(err) = &self.states[child].error {
                member_errors.push(err.clone());
            }
        }
        if !member_errors.is_empty() && self.states[index].error.is_none() {
            self.states[index].error = Some(RtError::aggregate(member_errors));
            for &child in children {
                if self.states[child].active() {
                    self.states[child].cancelling = true;
                }
            }
            return true;
        }

        // Derived done.
        let done = match &self.nodes[index].done_override {
            Some(cond) => self.eval(cond),
            None => {
                let any_active = children.iter().any(|&c| self.states[c].active());
                let auto_done = children.iter().all(|&c| {
                    let auto = self.nodes[c]
                        .wiring
                        .as_ref()
                        .map(|w| w.auto_start)
                        .unwrap_or(false);
                    !auto || self.states[c].done
                });
                !any_active && auto_done && (cancelling || children.iter().any(|&c| self.states[c].done))
            }
        };
        if done && !self.states[index].done {
            // Wind down any member still active, then finish.
            let mut lingering = false;
            for &child in children {
                if self.states[child].active() {
                    lingering = true;
                    if !self.states[child].cancelling {
                        self.states[child].cancelling = true;
                        changed = true;
                    }
                }
            }
            if !lingering {
                let s = &mut self.states[index];
                s.done = true;
                s.completed = !s.cancelling;
                changed = true;
            }
        } else if cancelling && !self.states[index].done {
            // Cancelled transaction finishes once nothing is active.
            let any_active = children.iter().any(|&c| self.states[c].active());
            if !any_active {
                self.states[index].done = true;
                changed = true;
            }
        }

        // Derived takeover.
        let takeover = match &self.nodes[index].takeover_override {
            Some(cond) => self.eval(cond),
            None => false,
        };
        if takeover != self.states[index].takeover {
            self.states[index].takeover = takeover;
            changed = true;
        }

        // Root-level graceful stop: wind down successfully.
        if stop && !self.states[index].done {
            for &child in children {
                if self.states[child].active() && !self.states[child].done {
                    self.states[child].completed = true;
                    self.states[child].done = true;
                    changed = true;
                }
            }
            let s = &mut self.states[index];
            s.completed = true;
            s.done = true;
            changed = true;
        }

        changed
    }

    fn fire_watchers(&mut self) {
        for i in 0..self.nodes.len() {
            for (w, watcher) in self.nodes[i].watchers.clone().iter().enumerate() {
                let now = self.eval(&watcher.when);
                let (prev, fired) = self.watch_edges[i][w];
                self.watch_edges[i][w].0 = now;
                let run = match watcher.mode {
                    crate::command::command::WatchMode::Once => now && !prev && !fired,
                    crate::command::command::WatchMode::OnEntry => now && !prev,
                    crate::command::command::WatchMode::OnExit => !now && prev,
                };
                if run {
                    self.watch_edges[i][w].1 = true;
                    (watcher.effect)();
                }
            }
        }
    }

    fn tap_ready(&mut self, index: usize) {
        if self.states[index].tapped_ready {
            return;
        }
        self.states[index].tapped_ready = true;
        if let Some(tap) = &self.nodes[index].tap {
            tap(CommandStatus::Ready);
        }
    }

    fn flush_taps(&mut self) {
        for i in 0..self.nodes.len() {
            if self.states[i].started && !self.states[i].tapped_running {
                self.states[i].tapped_running = true;
                if let Some(tap) = &self.nodes[i].tap {
                    tap(CommandStatus::Running);
                }
            }
            if self.states[i].finished() && !self.states[i].tapped_final {
                self.states[i].tapped_final = true;
                if let Some(tap) = &self.nodes[i].tap {
                    tap(CommandStatus::Terminated {
                        error: self.states[i].error.clone(),
                    });
                }
            }
        }
    }
}

/// Applies ignore/map rules in declaration order.
/// Returns `None` when the error is ignored.
fn apply_rules(rules: &[ErrorRule], error: RtError) -> Option<RtError> {
    for rule in rules {
        match rule {
            ErrorRule::Ignore { class } if error.has_class(class) => return None,
            ErrorRule::Map { from, to } if error.has_class(from) => return Some(to.clone()),
            _ => {}
        }
    }
    Some(error)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::command::TransactionMember;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_atomic_completes_on_hook() {
        let rt = SimRuntime::new();
        let mut cmd = Command::atomic("move");
        cmd.seal();
        let id = cmd.id();
        let handle = rt.load(cmd).await.unwrap();
        settle().await;
        assert_eq!(handle.status(), CommandStatus::Running);

        rt.complete(id);
        assert_eq!(handle.wait_final().await, None);
    }

    #[tokio::test]
    async fn test_atomic_fails_on_hook() {
        let rt = SimRuntime::new();
        let mut cmd = Command::atomic("move");
        cmd.seal();
        let id = cmd.id();
        let handle = rt.load(cmd).await.unwrap();
        settle().await;

        rt.fail(id, RtError::new("overload", "axis 2"));
        let err = handle.wait_final().await.unwrap();
        assert_eq!(err.class.as_ref(), "overload");
    }

    #[tokio::test]
    async fn test_wait_command_expires() {
        let rt = SimRuntime::new();
        let mut cmd = Command::wait("pause", Some(Duration::from_millis(10)));
        cmd.seal();
        let handle = rt.load(cmd).await.unwrap();
        assert_eq!(handle.wait_final().await, None);
    }

    #[tokio::test]
    async fn test_unsealed_command_rejected() {
        let rt = SimRuntime::new();
        let cmd = Command::atomic("move");
        assert!(matches!(
            rt.load(cmd).await,
            Err(ActivityError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_member_starts_on_condition() {
        let rt = SimRuntime::new();
        let mut first = Command::atomic("first");
        first.seal();
        let first_id = first.id();
        let first_done = first.done();
        let mut second = Command::atomic("second");
        second.seal();
        let second_id = second.id();

        let mut txn = Command::transaction(
            "seq",
            vec![
                TransactionMember::auto(first),
                TransactionMember::started_when(second, first_done),
            ],
        );
        let done = Condition::state(second_id, StateKind::Done);
        txn.override_done(done).unwrap();
        txn.seal();
        let handle = rt.load(txn).await.unwrap();
        settle().await;

        rt.complete(first_id);
        settle().await;
        // Second member only becomes completable once it started.
        rt.complete(second_id);
        assert_eq!(handle.wait_final().await, None);
    }

    #[tokio::test]
    async fn test_cancel_does_not_start_pending_members() {
        let rt = SimRuntime::new();
        let mut first = Command::atomic("first");
        first.seal();
        let first_id = first.id();
        let first_done = first.done();
        let mut second = Command::atomic("second");
        second.seal();
        let second_started = second.started();

        let started_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started_flag);
        let mut txn = Command::transaction(
            "seq",
            vec![
                TransactionMember::auto(first),
                TransactionMember::started_when(second, first_done),
            ],
        );
        txn.watch(
            second_started,
            crate::command::command::WatchMode::Once,
            Arc::new(move || flag.store(true, AtomicOrdering::SeqCst)),
        )
        .unwrap();
        txn.seal();
        let handle = rt.load(txn).await.unwrap();
        settle().await;

        handle.cancel();
        settle().await;
        rt.complete(first_id);
        assert_eq!(handle.wait_final().await, None);
        assert!(!started_flag.load(AtomicOrdering::SeqCst));
    }

    #[tokio::test]
    async fn test_ignored_error_class_completes() {
        let rt = SimRuntime::new();
        let mut cmd = Command::atomic("move");
        cmd.add_error_rule(ErrorRule::Ignore {
            class: "glitch".into(),
        })
        .unwrap();
        cmd.seal();
        let id = cmd.id();
        let handle = rt.load(cmd).await.unwrap();
        settle().await;

        rt.fail(id, RtError::new("glitch", "transient"));
        assert_eq!(handle.wait_final().await, None);
    }

    #[tokio::test]
    async fn test_load_after_starts_at_takeover() {
        let rt = SimRuntime::new();
        let mut first = Command::atomic("first");
        first.seal();
        let first_id = first.id();
        let first_handle = rt.load(first).await.unwrap();
        settle().await;

        let mut second = Command::atomic("second");
        second.seal();
        let second_handle = rt.load_after(second, &first_handle).await.unwrap();
        settle().await;
        assert_eq!(second_handle.status(), CommandStatus::Ready);

        rt.allow_takeover(first_id);
        settle().await;
        assert_eq!(second_handle.status(), CommandStatus::Running);
        // The predecessor was gracefully stopped by the hand-off.
        assert_eq!(first_handle.wait_final().await, None);
    }
}
