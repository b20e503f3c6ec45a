//! # ActivityBody: shared per-activity core.
//!
//! Every activity implementation embeds one `Arc<ActivityBody>`: identity,
//! device sets, the status cell, the internal state machine, the property
//! bag, the stored failure with its raise-once latch, and the pre-seal
//! declaration set (exceptions, cancel/stop conditions, listeners, triggers,
//! maintaining condition).
//!
//! [`ActivityBody::assemble`] is the seal step of command construction: it
//! materializes the declarations into the raw command exactly once per
//! declaration set (retried preparations re-assemble from the frozen set),
//! installs the status tap that drives the state machine, and wraps the
//! command into a transaction when triggers are attached.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::activity::activity::{Activity, ActivityRef, Predecessors, Prepared, ReadyCommand};
use crate::activity::property::PropertyBag;
use crate::activity::state::{self, AEvent, AState, Step};
use crate::activity::status::{ActivityStatus, StatusCell, StatusChange};
use crate::command::{
    Command, CommandStatus, Condition, Effect, ErrorRule, TransactionMember, WatchMode,
};
use crate::device::{DeviceRef, DeviceSet};
use crate::error::{ActivityError, RtError, SchedulingError};
use crate::events::{Event, EventKind};
use crate::scheduler::SchedulerRef;

/// Global counter for activity identities.
static ACTIVITY_SEQ: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an activity within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActivityId(u64);

/// A `(condition, activity)` trigger attached to an activity.
struct Trigger {
    when: Option<Condition>,
    activity: ActivityRef,
}

/// Declarations accumulated before the command is sealed.
#[derive(Default)]
struct Declarations {
    sealed: bool,
    errors: Vec<ErrorDecl>,
    cancel_when: Vec<Condition>,
    stop_when: Vec<Condition>,
    listeners: Vec<(Condition, WatchMode, Effect)>,
    triggers: Vec<Trigger>,
    maintain_when: Option<Condition>,
}

enum ErrorDecl {
    Raise { when: Condition, error: RtError },
    Propagate { from: Arc<str>, to: RtError },
    Ignore { class: Arc<str> },
}

/// Shared core of one activity.
pub struct ActivityBody {
    id: ActivityId,
    name: Cow<'static, str>,
    scheduler: SchedulerRef,
    affected_base: DeviceSet,
    controlled: Mutex<DeviceSet>,
    extra_affected: Mutex<DeviceSet>,
    status: StatusCell,
    machine: Mutex<AState>,
    decls: Mutex<Declarations>,
    properties: PropertyBag,
    failure: Mutex<Option<ActivityError>>,
    raised: AtomicBool,
    handle: Mutex<Option<crate::command::CommandHandle>>,
}

impl ActivityBody {
    /// Creates a body controlling `controlled` and affecting
    /// `controlled ∪ affected`.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        scheduler: SchedulerRef,
        controlled: DeviceSet,
        affected: DeviceSet,
    ) -> Arc<Self> {
        let affected_base = affected.union(&controlled);
        Arc::new(Self {
            id: ActivityId(ACTIVITY_SEQ.fetch_add(1, AtomicOrdering::Relaxed)),
            name: name.into(),
            scheduler,
            affected_base,
            controlled: Mutex::new(controlled),
            extra_affected: Mutex::new(DeviceSet::new()),
            status: StatusCell::new(),
            machine: Mutex::new(AState::New),
            decls: Mutex::new(Declarations::default()),
            properties: PropertyBag::new(),
            failure: Mutex::new(None),
            raised: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Activity identity.
    #[inline]
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler this activity was constructed with.
    pub fn scheduler(&self) -> &SchedulerRef {
        &self.scheduler
    }

    /// Current status.
    pub fn status(&self) -> ActivityStatus {
        self.status.get()
    }

    /// Subscribes to status changes (current value replays immediately).
    pub fn watch_status(&self) -> watch::Receiver<ActivityStatus> {
        self.status.subscribe()
    }

    /// Devices this activity drives.
    pub fn controlled_devices(&self) -> DeviceSet {
        self.controlled.lock().expect("controlled lock").clone()
    }

    /// Controlled ∪ additional affected devices.
    pub fn affected_devices(&self) -> DeviceSet {
        let controlled = self.controlled.lock().expect("controlled lock");
        let extra = self.extra_affected.lock().expect("extra lock");
        self.affected_base.union(&controlled).union(&extra)
    }

    /// Adds a device this activity excludes others from without driving it.
    ///
    /// Only meaningful before `begin_execute`.
    pub fn add_affected_device(&self, device: DeviceRef) -> Result<(), ActivityError> {
        if self.status() != ActivityStatus::New {
            return Err(SchedulingError::IllegalState {
                operation: "add_affected_device",
                status: self.status(),
            }
            .into());
        }
        self.extra_affected
            .lock()
            .expect("extra lock")
            .insert(device);
        Ok(())
    }

    /// The property bag.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Stored terminal failure, if the activity FAILED.
    pub fn failure(&self) -> Option<ActivityError> {
        self.failure.lock().expect("failure lock").clone()
    }

    pub(crate) fn set_controlled(&self, controlled: DeviceSet) {
        *self.controlled.lock().expect("controlled lock") = controlled;
    }

    pub(crate) fn store_handle(&self, handle: crate::command::CommandHandle) {
        *self.handle.lock().expect("handle lock") = Some(handle);
    }

    /// Handle of the loaded command, once the activity was admitted.
    pub fn handle(&self) -> Option<crate::command::CommandHandle> {
        self.handle.lock().expect("handle lock").clone()
    }

    // ---- declaration API (pre-seal) ----

    fn with_decls(
        &self,
        f: impl FnOnce(&mut Declarations),
    ) -> Result<(), ActivityError> {
        let mut decls = self.decls.lock().expect("decls lock");
        if decls.sealed {
            return Err(ActivityError::Sealed);
        }
        f(&mut decls);
        Ok(())
    }

    /// Declares: terminate with `error` the first time `when` becomes true.
    ///
    /// Conditions declared for the same error class are OR-combined at seal.
    pub fn declare_raise(&self, when: Condition, error: RtError) -> Result<(), ActivityError> {
        self.with_decls(|d| d.errors.push(ErrorDecl::Raise { when, error }))
    }

    /// Declares: an error of class `from` is replaced by `to`.
    pub fn declare_propagation(
        &self,
        from: impl Into<Arc<str>>,
        to: RtError,
    ) -> Result<(), ActivityError> {
        let from = from.into();
        self.with_decls(|d| d.errors.push(ErrorDecl::Propagate { from, to }))
    }

    /// Declares: errors of class `class` are silently ignored.
    pub fn declare_ignored(&self, class: impl Into<Arc<str>>) -> Result<(), ActivityError> {
        let class = class.into();
        self.with_decls(|d| d.errors.push(ErrorDecl::Ignore { class }))
    }

    /// Declares a condition that cancels the command.
    pub fn cancel_when(&self, when: Condition) -> Result<(), ActivityError> {
        self.with_decls(|d| d.cancel_when.push(when))
    }

    /// Declares a condition that gracefully stops the command.
    pub fn stop_when(&self, when: Condition) -> Result<(), ActivityError> {
        self.with_decls(|d| d.stop_when.push(when))
    }

    /// Attaches an arbitrary state-entered/state-left listener.
    pub fn watch_state(
        &self,
        when: Condition,
        mode: WatchMode,
        effect: Effect,
    ) -> Result<(), ActivityError> {
        self.with_decls(|d| d.listeners.push((when, mode, effect)))
    }

    /// Attaches a trigger: `activity` starts when `when` first becomes true
    /// (immediately when `None`).
    pub fn attach_trigger(
        &self,
        when: Option<Condition>,
        activity: ActivityRef,
    ) -> Result<(), ActivityError> {
        self.with_decls(|d| d.triggers.push(Trigger { when, activity }))
    }

    /// Declares the condition that flips the activity to MAINTAINING.
    pub fn maintain_when(&self, when: Condition) -> Result<(), ActivityError> {
        self.with_decls(|d| d.maintain_when = Some(when))
    }

    // ---- assembly (seal) ----

    /// Seals the declarations into `raw` and returns the prepared command.
    ///
    /// `maintaining` is the per-preparation maintaining condition supplied by
    /// combinators (OR-combined with a declared one); `predecessors` is
    /// forwarded to trigger preparation.
    pub async fn assemble(
        self: &Arc<Self>,
        raw: Command,
        maintaining: Option<Condition>,
        predecessors: &Predecessors,
    ) -> Result<Prepared, ActivityError> {
        // Freeze declarations; re-assembly on prepare retries reads the same set.
        struct Frozen {
            rules: Vec<ErrorRule>,
            cancel_when: Vec<Condition>,
            stop_when: Vec<Condition>,
            listeners: Vec<(Condition, WatchMode, Effect)>,
            triggers: Vec<(Option<Condition>, ActivityRef)>,
            maintain_when: Option<Condition>,
        }
        let frozen = {
            let mut decls = self.decls.lock().expect("decls lock");
            decls.sealed = true;
            Frozen {
                rules: build_error_rules(&decls.errors),
                cancel_when: decls.cancel_when.clone(),
                stop_when: decls.stop_when.clone(),
                listeners: decls
                    .listeners
                    .iter()
                    .map(|(c, m, e)| (c.clone(), *m, Arc::clone(e)))
                    .collect(),
                triggers: decls
                    .triggers
                    .iter()
                    .map(|t| (t.when.clone(), Arc::clone(&t.activity)))
                    .collect(),
                maintain_when: decls.maintain_when.clone(),
            }
        };

        // Triggers wrap the command in a transaction.
        let mut cmd = if frozen.triggers.is_empty() {
            raw
        } else {
            let mut trigger_cmds = Vec::with_capacity(frozen.triggers.len());
            for (when, activity) in &frozen.triggers {
                match activity.prepare(predecessors).await? {
                    Prepared::Ready(ready) => trigger_cmds.push((when.clone(), ready.command)),
                    Prepared::NotYetComplete { blocking } => {
                        return Ok(Prepared::NotYetComplete { blocking })
                    }
                }
            }

            let main_takeover = raw.takeover_allowed();
            let main_done = raw.done();
            let mut members = vec![TransactionMember::auto(raw)];
            let mut any_trigger_active = Condition::False;
            for (when, trigger_cmd) in trigger_cmds {
                any_trigger_active = any_trigger_active.or(trigger_cmd.active());
                members.push(match when {
                    Some(cond) => TransactionMember::started_when(trigger_cmd, cond),
                    None => TransactionMember::auto(trigger_cmd),
                });
            }
            let mut txn = Command::transaction(format!("{}+triggers", self.name), members);
            let no_trigger_active = any_trigger_active.negated();
            txn.override_takeover(main_takeover.and(no_trigger_active.clone()))?;
            txn.override_done(main_done.and(no_trigger_active))?;
            txn
        };

        for cond in frozen.cancel_when {
            cmd.cancel_when(cond)?;
        }
        for cond in frozen.stop_when {
            cmd.stop_when(cond)?;
        }
        for rule in frozen.rules {
            cmd.add_error_rule(rule)?;
        }
        for (when, mode, effect) in frozen.listeners {
            cmd.watch(when, mode, effect)?;
        }

        let maintain = match (frozen.maintain_when, maintaining.clone()) {
            (Some(a), Some(b)) => Some(a.or(b)),
            (a, b) => a.or(b),
        };
        if let Some(cond) = maintain.clone() {
            let body = Arc::clone(self);
            cmd.watch(
                cond,
                WatchMode::Once,
                Arc::new(move || body.on_maintain()),
            )?;
        }

        let body = Arc::clone(self);
        cmd.set_status_tap(Arc::new(move |status| body.on_command_status(status)))?;
        cmd.seal();

        Ok(Prepared::Ready(ReadyCommand {
            command: cmd,
            controlled: self.controlled_devices(),
            maintaining: maintain,
        }))
    }

    // ---- state machine wiring ----

    /// Applies a command-status notification (tap side).
    fn on_command_status(self: &Arc<Self>, status: CommandStatus) {
        let event = match status {
            CommandStatus::Ready => AEvent::Ready,
            CommandStatus::Running => AEvent::Running,
            CommandStatus::Terminated { error } => AEvent::Terminated(error),
            CommandStatus::Error { error } => AEvent::Terminated(Some(error)),
        };
        // Command events never surface illegal transitions to a caller;
        // they are logged on the bus by apply_event.
        let _ = self.apply_event(event, "command_status");
    }

    fn on_maintain(self: &Arc<Self>) {
        let _ = self.apply_event(AEvent::MaintainStart, "maintain");
    }

    /// Applies one state-machine event. `Illegal` surfaces as an error;
    /// guard rejections from the status cell are logged, never applied.
    pub(crate) fn apply_event(
        &self,
        event: AEvent,
        operation: &'static str,
    ) -> Result<(), ActivityError> {
        let mut machine = self.machine.lock().expect("machine lock");
        match state::apply(*machine, &event) {
            Step::Transition { path } => {
                for st in path {
                    *machine = st;
                    if st == AState::Failed {
                        let err = match &event {
                            AEvent::Terminated(Some(e)) => ActivityError::runtime(e.clone()),
                            _ => ActivityError::runtime(RtError::new(
                                "unknown",
                                "command failed without error detail",
                            )),
                        };
                        let mut failure = self.failure.lock().expect("failure lock");
                        if failure.is_none() {
                            *failure = Some(err);
                        }
                    }
                    match self.status.set(st.status()) {
                        StatusChange::Applied | StatusChange::Unchanged => {}
                        StatusChange::RejectedMonotonic | StatusChange::RejectedTerminal => {
                            self.scheduler.bus().publish(
                                Event::new(EventKind::IllegalTransition)
                                    .with_activity(self.name.as_ref())
                                    .with_status(st.status())
                                    .with_reason(operation),
                            );
                        }
                    }
                }
                Ok(())
            }
            Step::Ignored => Ok(()),
            Step::Illegal => Err(SchedulingError::IllegalState {
                operation,
                status: self.status(),
            }
            .into()),
        }
    }

    /// Applies `Begin` if the activity is still NEW; a command notification
    /// may legitimately have advanced it already.
    pub(crate) fn apply_begin(&self) {
        let machine = self.machine.lock().expect("machine lock");
        if *machine != AState::New {
            return;
        }
        drop(machine);
        let _ = self.apply_event(AEvent::Begin, "begin_execute");
    }

    // ---- blocking operations ----

    /// Awaits a settled status; raises a stored failure exactly once.
    pub(crate) async fn end_wait(&self) -> Result<(), ActivityError> {
        if self.status() == ActivityStatus::New {
            return Err(SchedulingError::IllegalState {
                operation: "end_execute",
                status: ActivityStatus::New,
            }
            .into());
        }
        let settled = self.status.wait_for(|s| s.is_settled()).await;
        if settled == ActivityStatus::Failed && !self.raised.swap(true, AtomicOrdering::SeqCst) {
            return Err(self.failure().unwrap_or_else(|| {
                ActivityError::runtime(RtError::new("unknown", "failure without stored error"))
            }));
        }
        Ok(())
    }

    /// Awaits a fully terminal status (Completed or Failed), without
    /// consuming the raise-once latch.
    pub(crate) async fn wait_terminal(&self) -> ActivityStatus {
        self.status.wait_for(|s| s.is_terminal()).await
    }

    /// Requests cancellation of the underlying command.
    pub(crate) fn cancel(&self) -> Result<(), ActivityError> {
        if self.status() == ActivityStatus::New {
            return Err(SchedulingError::IllegalState {
                operation: "cancel_execute",
                status: ActivityStatus::New,
            }
            .into());
        }
        if let Some(handle) = self.handle() {
            handle.cancel();
        }
        Ok(())
    }
}

/// Materializes error declarations in declaration order, OR-combining raise
/// conditions that share an error class.
fn build_error_rules(decls: &[ErrorDecl]) -> Vec<ErrorRule> {
    let mut rules: Vec<ErrorRule> = Vec::with_capacity(decls.len());
    for decl in decls {
        match decl {
            ErrorDecl::Raise { when, error } => {
                let existing = rules.iter_mut().find_map(|r| match r {
                    ErrorRule::Raise {
                        when: w,
                        error: e,
                    } if e.class == error.class => Some(w),
                    _ => None,
                });
                match existing {
                    Some(w) => {
                        *w = std::mem::replace(w, Condition::False).or(when.clone());
                    }
                    None => rules.push(ErrorRule::Raise {
                        when: when.clone(),
                        error: error.clone(),
                    }),
                }
            }
            ErrorDecl::Propagate { from, to } => rules.push(ErrorRule::Map {
                from: Arc::clone(from),
                to: to.clone(),
            }),
            ErrorDecl::Ignore { class } => rules.push(ErrorRule::Ignore {
                class: Arc::clone(class),
            }),
        }
    }
    rules
}
