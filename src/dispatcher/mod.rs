//! The dispatch engine
//!
//! ```text
//!            notify_* / inject_event
//!                      |
//!                      v
//!               +-------------+
//!               |   inbound   |  batching, throttling, app-switch
//!               +-------------+
//!                      |
//!                      v  dispatch_once
//!               +-------------+
//!               |   pending   |  drop reasons, key repeat, intercept
//!               +-------------+
//!                      |
//!                      v  target resolution
//!            +-------------------+
//!            | per-connection    |  one in-flight event per consumer,
//!            | outbound queues   |  finished signals drive the next
//!            +-------------------+
//! ```
//!
//! [`Dispatcher::dispatch_once`] runs one non-blocking pump of the loop
//! and returns the time it next wants to run. [`DispatcherThread`] owns
//! the blocking loop around it; tests drive `dispatch_once` directly
//! with a fake clock.
//!
//! Policy callbacks never run under the dispatcher lock. The pump
//! queues [`commands::Command`]s under the lock and executes them after
//! releasing it.

pub(crate) mod commands;
mod cycle;
pub mod targets;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::channel::{InputChannel, TransportError};
use crate::config::{Clock, DispatcherConfig, MOTION_SAMPLE_COALESCE_INTERVAL};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{DispatchError, Result};
use crate::event::entry::{
    ConfigurationChangedEntry, DeviceResetEntry, EventEntry, InjectionResult, InjectionState,
    KeyEntry, MotionEntry,
};
use crate::event::{
    InputEvent, KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent, PolicyFlags, Source,
};
use crate::policy::{
    DispatchPolicy, InterceptResult, USER_ACTIVITY_EVENT_BUTTON, USER_ACTIVITY_EVENT_TOUCH,
};
use crate::state::input_state::CancelScope;
use crate::state::touch_state::TouchState;
use crate::window::{InputApplication, InputWindow};
use commands::Command;
use cycle::key_event_from_entry;
use targets::TargetResolution;

/// Home key
const KEYCODE_HOME: i32 = 3;
/// End-call key; also leaves the current application
const KEYCODE_ENDCALL: i32 = 6;

/// How injected event delivery is awaited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionSyncMode {
    /// Fire and forget
    None,
    /// Block until the event is dispatched or dropped
    WaitForResult,
    /// Block until every foreground consumer finished the event
    WaitForFinished,
}

/// Why an inbound event is being discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    /// The policy consumed it before it could reach a window
    Policy,
    /// Dispatch is administratively disabled
    Disabled,
    /// Dropped to speed up a pending application switch
    AppSwitch,
    /// Part of a gesture abandoned after a target stopped responding
    Blocked,
    /// Sat in the queue longer than the stale timeout
    Stale,
}

/// What the dispatcher is currently waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetWaitCause {
    /// Nothing
    None,
    /// Indefinite wait on the system itself
    SystemNotResponsive,
    /// Bounded wait on an application target
    ApplicationNotReady,
}

/// Bookkeeping for a parked pending event
#[derive(Debug)]
pub(crate) struct TargetWait {
    pub(crate) cause: TargetWaitCause,
    pub(crate) start_time: i64,
    pub(crate) deadline: i64,
    /// Set when the policy gave up on the target; the parked event is
    /// dropped on the next pump
    pub(crate) expired: bool,
    pub(crate) application: Option<String>,
    pub(crate) channel_id: Option<u64>,
    /// The not-responding notification was queued; the deadline stays
    /// open until the policy answers
    pub(crate) anr_posted: bool,
}

impl TargetWait {
    fn new() -> Self {
        Self {
            cause: TargetWaitCause::None,
            start_time: 0,
            deadline: i64::MAX,
            expired: false,
            application: None,
            channel_id: None,
            anr_posted: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Synthetic key repeat bookkeeping
#[derive(Debug)]
struct KeyRepeatState {
    /// Last key down, source of the repeats
    entry: KeyEntry,
    /// When the next synthetic repeat fires; `i64::MAX` when the device
    /// delivers its own repeats
    next_repeat_time: i64,
}

/// Motion throttle bookkeeping, per most recent device
#[derive(Debug)]
struct ThrottleState {
    device_id: i32,
    source: Source,
    last_dispatch_time: i64,
}

/// Everything behind the dispatcher lock
pub(crate) struct DispatchState {
    pub(crate) next_seq: u64,
    pub(crate) enabled: bool,
    pub(crate) frozen: bool,
    pub(crate) filter_enabled: bool,
    pub(crate) inbound: VecDeque<EventEntry>,
    /// Event currently being resolved; stays parked across pumps while
    /// its target is not ready
    pub(crate) pending: Option<EventEntry>,
    pub(crate) connections: HashMap<u64, Connection>,
    pub(crate) monitors: Vec<u64>,
    /// Windows in Z order, topmost first
    pub(crate) windows: Vec<InputWindow>,
    pub(crate) focused_application: Option<InputApplication>,
    pub(crate) touch: TouchState,
    pub(crate) target_wait: TargetWait,
    pub(crate) last_hover_channel: Option<u64>,
    /// When earlier queued events start being dropped to speed up an
    /// application switch; `i64::MAX` when no switch is pending
    app_switch_due_time: i64,
    app_switch_saw_down: bool,
    key_repeat: Option<KeyRepeatState>,
    /// Pointer motions with a smaller sequence number are dropped;
    /// set when a gesture is abandoned after a target stopped responding
    next_unblocked_seq: Option<u64>,
    throttle: Option<ThrottleState>,
    pub(crate) commands: VecDeque<Command>,
    /// Set by producers so the loop thread re-pumps instead of sleeping
    pub(crate) wake_pending: bool,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            next_seq: 0,
            enabled: true,
            frozen: false,
            filter_enabled: false,
            inbound: VecDeque::new(),
            pending: None,
            connections: HashMap::new(),
            monitors: Vec::new(),
            windows: Vec::new(),
            focused_application: None,
            touch: TouchState::new(),
            target_wait: TargetWait::new(),
            last_hover_channel: None,
            app_switch_due_time: i64::MAX,
            app_switch_saw_down: false,
            key_repeat: None,
            next_unblocked_seq: None,
            throttle: None,
            commands: VecDeque::new(),
            wake_pending: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn is_app_switch_key_code(key_code: i32) -> bool {
    key_code == KEYCODE_HOME || key_code == KEYCODE_ENDCALL
}

/// The input dispatch engine
///
/// All methods are safe to call from any thread. Producers feed events
/// through `notify_*` and `inject_event`; a loop thread (or a test)
/// pumps [`Dispatcher::dispatch_once`]; consumers answer through
/// [`Dispatcher::handle_finished_signal`].
pub struct Dispatcher {
    pub(crate) policy: Arc<dyn DispatchPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    pub(crate) state: Mutex<DispatchState>,
    /// Wakes the loop thread
    pub(crate) looper: Condvar,
    /// Wakes injectors waiting for a result
    injection_result: Condvar,
    /// Wakes injectors waiting for consumers to finish
    pub(crate) injection_finished: Condvar,
}

impl Dispatcher {
    /// New dispatcher using the policy's tuning parameters.
    pub fn new(policy: Arc<dyn DispatchPolicy>, clock: Arc<dyn Clock>) -> Result<Self> {
        let config = policy.get_dispatcher_configuration();
        config.validate()?;
        info!(
            key_repeat_timeout = config.key_repeat_timeout,
            max_events_per_second = config.max_events_per_second,
            "Input dispatcher created"
        );
        Ok(Self {
            policy,
            clock,
            config,
            state: Mutex::new(DispatchState::new()),
            looper: Condvar::new(),
            injection_result: Condvar::new(),
            injection_finished: Condvar::new(),
        })
    }

    /// Run one pump of the dispatch loop without blocking.
    ///
    /// Returns the absolute time of the next thing the loop needs to do:
    /// `0` means pump again immediately, `i64::MAX` means idle until an
    /// event arrives.
    pub fn dispatch_once(&self) -> i64 {
        let mut next_wake = i64::MAX;
        let commands: Vec<Command> = {
            let mut state = self.state.lock();
            if state.commands.is_empty() {
                self.dispatch_once_inner(&mut state, &mut next_wake);
            }
            state.commands.drain(..).collect()
        };
        if !commands.is_empty() {
            self.run_commands(commands);
            return 0;
        }
        next_wake
    }

    fn dispatch_once_inner(&self, state: &mut DispatchState, next_wake: &mut i64) {
        let current_time = self.clock.now();

        if state.frozen {
            trace!("Dispatch frozen, waiting for thaw");
            return;
        }

        let mut is_app_switch_due = current_time >= state.app_switch_due_time;
        if !is_app_switch_due && state.app_switch_due_time < *next_wake {
            *next_wake = state.app_switch_due_time;
        }

        if state.pending.is_none() {
            if state.inbound.is_empty() {
                let repeat_due = state
                    .key_repeat
                    .as_ref()
                    .is_some_and(|r| r.next_repeat_time <= current_time);
                if repeat_due {
                    let seq = state.next_seq();
                    let delay = self.config.key_repeat_delay;
                    if let Some(repeat) = state.key_repeat.as_mut() {
                        let entry = repeat.entry.make_repeat(seq, current_time);
                        repeat.entry = entry.clone();
                        repeat.next_repeat_time = current_time + delay;
                        trace!(
                            key_code = entry.key_code,
                            repeat_count = entry.repeat_count,
                            "Synthesized key repeat"
                        );
                        state.pending = Some(EventEntry::Key(entry));
                    }
                } else if let Some(repeat) = &state.key_repeat {
                    if repeat.next_repeat_time < *next_wake {
                        *next_wake = repeat.next_repeat_time;
                    }
                }
            } else {
                if let Some(deadline) = self.throttle_deadline(state, current_time) {
                    if deadline < *next_wake {
                        *next_wake = deadline;
                    }
                    return;
                }
                let entry = match state.inbound.pop_front() {
                    Some(entry) => entry,
                    None => return,
                };
                state.target_wait.reset();
                state.pending = Some(entry);
            }
        }

        match state.pending.take() {
            None => {}
            Some(EventEntry::ConfigurationChanged(entry)) => {
                state.commands.push_back(Command::NotifyConfigurationChanged {
                    event_time: entry.event_time,
                });
                *next_wake = 0;
            }
            Some(EventEntry::DeviceReset(entry)) => {
                self.dispatch_device_reset(state, current_time, &entry);
                *next_wake = 0;
            }
            Some(entry) => {
                // A parked event can become droppable while it waits
                // (app switch due, dispatch disabled, gone stale), so
                // the reason is re-derived on every pass.
                let drop_reason =
                    self.classify_drop(state, current_time, &entry, &mut is_app_switch_due);
                match entry {
                    EventEntry::Key(entry) => {
                        match self.dispatch_key(state, current_time, entry, drop_reason, next_wake)
                        {
                            Some(parked) => state.pending = Some(EventEntry::Key(parked)),
                            None => *next_wake = 0,
                        }
                    }
                    EventEntry::Motion(entry) => {
                        match self.dispatch_motion(
                            state,
                            current_time,
                            entry,
                            drop_reason,
                            next_wake,
                        ) {
                            Some(parked) => state.pending = Some(EventEntry::Motion(parked)),
                            None => *next_wake = 0,
                        }
                    }
                    _ => *next_wake = 0,
                }
            }
        }
    }

    /// Decide at dequeue time whether the event should be discarded.
    fn classify_drop(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        entry: &EventEntry,
        is_app_switch_due: &mut bool,
    ) -> Option<DropReason> {
        let policy_flags = match entry {
            EventEntry::Key(k) => k.policy_flags,
            EventEntry::Motion(m) => m.policy_flags,
            _ => return None,
        };
        if !policy_flags.contains(PolicyFlags::PASS_TO_USER) {
            return Some(DropReason::Policy);
        }
        if !state.enabled {
            return Some(DropReason::Disabled);
        }
        if *is_app_switch_due {
            match entry {
                EventEntry::Key(k)
                    if k.action == KeyAction::Up
                        && !k.flags.contains(KeyFlags::CANCELED)
                        && is_app_switch_key_code(k.key_code) =>
                {
                    // The switch key itself made it to the head in time.
                    state.app_switch_due_time = i64::MAX;
                    *is_app_switch_due = false;
                }
                _ => return Some(DropReason::AppSwitch),
            }
        }
        if let EventEntry::Motion(m) = entry {
            if m.source.is_pointer() {
                if let Some(threshold) = state.next_unblocked_seq {
                    if m.seq < threshold {
                        return Some(DropReason::Blocked);
                    }
                    state.next_unblocked_seq = None;
                }
            }
        }
        if !entry.is_injected()
            && current_time - entry.event_time() >= self.config.stale_event_timeout
        {
            return Some(DropReason::Stale);
        }
        None
    }

    /// Discard the dequeued event, settling injection and keeping
    /// consumer state consistent.
    fn drop_event(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        entry: EventEntry,
        reason: DropReason,
    ) {
        debug!(?reason, seq = entry.seq(), "Dropping inbound event");
        // A policy drop means the event was consumed on the user's
        // behalf; the injector should see success.
        let result = if reason == DropReason::Policy {
            InjectionResult::Succeeded
        } else {
            InjectionResult::Failed
        };
        self.set_injection_result(entry.injection(), result);
        match &entry {
            EventEntry::Key(_) => {
                self.synthesize_cancelation_events_for_all_connections(
                    state,
                    current_time,
                    CancelScope::NonPointerEvents,
                    None,
                    "inbound key was dropped",
                );
            }
            EventEntry::Motion(m) if m.source.is_pointer() => {
                self.synthesize_cancelation_events_for_all_connections(
                    state,
                    current_time,
                    CancelScope::PointerEvents,
                    None,
                    "inbound touch was dropped",
                );
            }
            EventEntry::Motion(_) => {
                self.synthesize_cancelation_events_for_all_connections(
                    state,
                    current_time,
                    CancelScope::NonPointerEvents,
                    None,
                    "inbound motion was dropped",
                );
            }
            _ => {}
        }
    }

    /// Dispatch a key entry. Returns the entry when it must stay parked.
    fn dispatch_key(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        mut entry: KeyEntry,
        mut drop_reason: Option<DropReason>,
        next_wake: &mut i64,
    ) -> Option<KeyEntry> {
        if !entry.dispatch_in_progress {
            if entry.repeat_count == 0
                && entry.action == KeyAction::Down
                && entry.policy_flags.contains(PolicyFlags::TRUSTED)
                && !entry.policy_flags.contains(PolicyFlags::DISABLE_KEY_REPEAT)
            {
                let mut continues_repeat = false;
                if let Some(repeat) = state.key_repeat.as_mut() {
                    if repeat.entry.device_id == entry.device_id
                        && repeat.entry.source == entry.source
                        && repeat.entry.key_code == entry.key_code
                    {
                        // The device delivers its own repeats; fold this
                        // down into the repeat stream and stop
                        // synthesizing.
                        entry.repeat_count = repeat.entry.repeat_count + 1;
                        if entry.repeat_count == 1 {
                            entry.flags |= KeyFlags::LONG_PRESS;
                        }
                        repeat.entry = entry.clone();
                        repeat.next_repeat_time = i64::MAX;
                        continues_repeat = true;
                    }
                }
                if !continues_repeat {
                    state.key_repeat = Some(KeyRepeatState {
                        entry: entry.clone(),
                        next_repeat_time: current_time + self.config.key_repeat_timeout,
                    });
                }
            } else if entry.action == KeyAction::Up {
                state.key_repeat = None;
            }
            entry.dispatch_in_progress = true;
        }

        if entry.intercept.is_none() {
            if entry.policy_flags.contains(PolicyFlags::PASS_TO_USER) {
                let channel_id = state.windows.iter().find(|w| w.has_focus).map(|w| w.channel_id);
                state.commands.push_back(Command::InterceptKeyBeforeDispatching {
                    channel_id,
                    seq: entry.seq,
                    event: key_event_from_entry(&entry),
                });
                // Parked until the policy answers.
                return Some(entry);
            }
            entry.intercept = Some(InterceptResult::Continue);
        }
        if entry.intercept == Some(InterceptResult::Skip) && drop_reason.is_none() {
            drop_reason = Some(DropReason::Policy);
        }

        if let Some(reason) = drop_reason {
            self.drop_event(state, current_time, EventEntry::Key(entry), reason);
            return None;
        }

        let trusted = entry.policy_flags.contains(PolicyFlags::TRUSTED);
        match state.find_focused_window_targets(
            current_time,
            entry.injection.as_ref(),
            trusted,
            true,
            next_wake,
        ) {
            TargetResolution::Pending => Some(entry),
            TargetResolution::Failed => {
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::Failed);
                None
            }
            TargetResolution::PermissionDenied => {
                self.set_injection_result(
                    entry.injection.as_ref(),
                    InjectionResult::PermissionDenied,
                );
                None
            }
            TargetResolution::TimedOut => {
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::TimedOut);
                None
            }
            TargetResolution::Succeeded(mut targets) => {
                state.add_monitor_targets(&mut targets);
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::Succeeded);
                state.commands.push_back(Command::PokeUserActivity {
                    event_time: entry.event_time,
                    event_type: USER_ACTIVITY_EVENT_BUTTON,
                });
                let event = Arc::new(EventEntry::Key(entry));
                self.dispatch_event_to_targets(state, current_time, event, &targets);
                None
            }
        }
    }

    /// Dispatch a motion entry. Returns the entry when it must stay
    /// parked.
    fn dispatch_motion(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        mut entry: MotionEntry,
        drop_reason: Option<DropReason>,
        next_wake: &mut i64,
    ) -> Option<MotionEntry> {
        entry.dispatch_in_progress = true;

        if let Some(reason) = drop_reason {
            self.drop_event(state, current_time, EventEntry::Motion(entry), reason);
            return None;
        }

        let pointer = entry.source.is_pointer();
        let trusted = entry.policy_flags.contains(PolicyFlags::TRUSTED);
        let mut conflicting_pointer_actions = false;
        let resolution = if pointer {
            state.find_touched_window_targets(
                current_time,
                &entry,
                next_wake,
                &mut conflicting_pointer_actions,
            )
        } else {
            state.find_focused_window_targets(
                current_time,
                entry.injection.as_ref(),
                trusted,
                false,
                next_wake,
            )
        };
        if conflicting_pointer_actions {
            warn!("Conflicting pointer actions, canceling the current gesture");
            self.synthesize_cancelation_events_for_all_connections(
                state,
                current_time,
                CancelScope::PointerEvents,
                None,
                "conflicting pointer actions",
            );
        }

        match resolution {
            TargetResolution::Pending => Some(entry),
            TargetResolution::Failed => {
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::Failed);
                None
            }
            TargetResolution::PermissionDenied => {
                self.set_injection_result(
                    entry.injection.as_ref(),
                    InjectionResult::PermissionDenied,
                );
                None
            }
            TargetResolution::TimedOut => {
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::TimedOut);
                None
            }
            TargetResolution::Succeeded(mut targets) => {
                state.add_monitor_targets(&mut targets);
                self.set_injection_result(entry.injection.as_ref(), InjectionResult::Succeeded);
                if entry.policy_flags.contains(PolicyFlags::PASS_TO_USER) {
                    state.commands.push_back(Command::PokeUserActivity {
                        event_time: entry.event_time,
                        event_type: if pointer {
                            USER_ACTIVITY_EVENT_TOUCH
                        } else {
                            USER_ACTIVITY_EVENT_BUTTON
                        },
                    });
                }
                if entry.action.can_batch() {
                    state.throttle = Some(ThrottleState {
                        device_id: entry.device_id,
                        source: entry.source,
                        last_dispatch_time: current_time,
                    });
                }
                // Hover and slippery transitions change the action per
                // target, so only the first sample can go out in this
                // batch; the rest is re-queued as a plain move.
                let transition = targets.iter().any(|t| {
                    t.flags.intersects(
                        targets::TargetFlags::DISPATCH_HOVER_ENTER
                            | targets::TargetFlags::DISPATCH_HOVER_EXIT
                            | targets::TargetFlags::DISPATCH_SLIPPERY_EXIT
                            | targets::TargetFlags::DISPATCH_SLIPPERY_ENTER,
                    )
                });
                if transition && entry.sample_count() > 1 {
                    let seq = state.next_seq();
                    if let Some(rest) = entry.split_after_first_sample(seq) {
                        state.inbound.push_front(EventEntry::Motion(rest));
                    }
                }
                let event = Arc::new(EventEntry::Motion(entry));
                self.dispatch_event_to_targets(state, current_time, event, &targets);
                None
            }
        }
    }

    fn dispatch_device_reset(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        entry: &DeviceResetEntry,
    ) {
        debug!(device_id = entry.device_id, "Device was reset");
        self.synthesize_cancelation_events_for_all_connections(
            state,
            current_time,
            CancelScope::All,
            Some(entry.device_id),
            "device was reset",
        );
        if state.touch.device_id == entry.device_id {
            state.touch.reset();
        }
        if state
            .key_repeat
            .as_ref()
            .is_some_and(|r| r.entry.device_id == entry.device_id)
        {
            state.key_repeat = None;
        }
    }

    /// Wake deadline imposed by motion throttling, if the head of the
    /// inbound queue must wait. Only the sole queued event is throttled;
    /// delaying it behind others would reorder the stream.
    fn throttle_deadline(&self, state: &DispatchState, current_time: i64) -> Option<i64> {
        let interval = self.config.min_motion_interval()?;
        if state.inbound.len() != 1 {
            return None;
        }
        let EventEntry::Motion(motion) = state.inbound.front()? else {
            return None;
        };
        if !motion.action.can_batch() {
            return None;
        }
        let throttle = state.throttle.as_ref()?;
        if throttle.device_id != motion.device_id || throttle.source != motion.source {
            return None;
        }
        let deadline = throttle.last_dispatch_time + interval;
        (current_time < deadline).then_some(deadline)
    }

    fn set_injection_result(
        &self,
        injection: Option<&Arc<InjectionState>>,
        result: InjectionResult,
    ) {
        if let Some(injection) = injection {
            injection.set_result(result);
            self.injection_result.notify_all();
            self.injection_finished.notify_all();
        }
    }

    /// Apply the policy's answer to a not-responding target: a positive
    /// timeout extends the wait, anything else abandons the target.
    pub(crate) fn resume_after_targets_not_ready(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        new_timeout: i64,
    ) {
        if state.target_wait.cause == TargetWaitCause::None {
            return;
        }
        if new_timeout > 0 {
            debug!(new_timeout, "Extending wait for unresponsive target");
            state.target_wait.deadline = current_time.saturating_add(new_timeout);
            state.target_wait.anr_posted = false;
            return;
        }
        warn!(
            application = ?state.target_wait.application,
            channel_id = state.target_wait.channel_id,
            "Giving up on unresponsive target"
        );
        state.target_wait.expired = true;
        state.target_wait.deadline = i64::MAX;
        if let Some(channel_id) = state.target_wait.channel_id {
            self.synthesize_cancelation_events_for_connection(
                state,
                current_time,
                channel_id,
                CancelScope::All,
                None,
                "application is not responding",
            );
        }
        state.touch.reset();
        // Skip queued pointer motion until the next gesture begins.
        state.next_unblocked_seq = state.inbound.iter().find_map(|e| match e {
            EventEntry::Motion(m)
                if m.source.is_pointer() && m.action == MotionAction::Down =>
            {
                Some(m.seq)
            }
            _ => None,
        });
    }

    // --- producer API ---

    /// Queue a key event from an input device.
    pub fn notify_key(&self, event: &KeyEvent) {
        let mut policy_flags = event.policy_flags;
        if !self.policy.is_key_repeat_enabled() {
            policy_flags |= PolicyFlags::DISABLE_KEY_REPEAT;
        }
        self.policy.intercept_key_before_queueing(event, &mut policy_flags);

        if self.filter_swallowed(&InputEvent::Key(event.clone()), policy_flags) {
            return;
        }

        let mut state = self.state.lock();
        let seq = state.next_seq();
        let mut entry = KeyEntry::from_event(seq, event, None);
        entry.policy_flags = policy_flags;
        trace!(seq, key_code = entry.key_code, action = ?entry.action, "Queued key event");
        state.inbound.push_back(EventEntry::Key(entry));

        if policy_flags.contains(PolicyFlags::TRUSTED) && is_app_switch_key_code(event.key_code) {
            match event.action {
                KeyAction::Down => state.app_switch_saw_down = true,
                KeyAction::Up => {
                    if state.app_switch_saw_down {
                        state.app_switch_saw_down = false;
                        state.app_switch_due_time =
                            event.event_time + self.config.app_switch_timeout;
                        debug!("App switch key released, expediting queue");
                        state.commands.push_back(Command::NotifySwitch {
                            event_time: event.event_time,
                            switch_code: event.key_code,
                            switch_value: 1,
                        });
                    }
                }
            }
        }
        self.wake(&mut state);
    }

    /// Queue a motion event, batching and streaming where possible.
    pub fn notify_motion(&self, event: &MotionEvent) -> Result<()> {
        event.validate().map_err(DispatchError::InvalidEvent)?;
        let mut policy_flags = event.policy_flags;
        self.policy
            .intercept_generic_before_queueing(event.event_time, &mut policy_flags);

        if self.filter_swallowed(&InputEvent::Motion(event.clone()), policy_flags) {
            return Ok(());
        }

        let mut state = self.state.lock();

        if event.action.can_batch() {
            // Batch onto the inbound tail when the stream continues it.
            if let Some(EventEntry::Motion(tail)) = state.inbound.back() {
                if tail.device_id == event.device_id
                    && tail.source == event.source
                    && tail.action == event.action
                    && tail.pointer_properties.len() == event.pointer_coords.len()
                {
                    let coalesce = self.config.min_motion_interval().is_some()
                        && event.event_time - tail.last_sample_time()
                            < MOTION_SAMPLE_COALESCE_INTERVAL;
                    if coalesce {
                        tail.coalesce_sample(event.event_time, event.pointer_coords.clone());
                    } else {
                        tail.append_sample(event.event_time, event.pointer_coords.clone());
                    }
                    trace!(seq = tail.seq, "Batched motion sample onto queued event");
                    return Ok(());
                }
            }
            // Stream onto an event already in flight when the queue has
            // fully drained.
            if state.inbound.is_empty()
                && state.pending.is_none()
                && self.stream_motion_sample(&mut state, event)
            {
                return Ok(());
            }
        }

        let seq = state.next_seq();
        let mut entry = MotionEntry::from_event(seq, event, None);
        entry.policy_flags = policy_flags;
        trace!(seq, action = ?entry.action, "Queued motion event");
        state.inbound.push_back(EventEntry::Motion(entry));
        self.wake(&mut state);
        Ok(())
    }

    /// Append the sample to a motion event already published to its
    /// consumers. Returns whether the sample was taken.
    fn stream_motion_sample(&self, state: &mut DispatchState, event: &MotionEvent) -> bool {
        let mut shared: Option<Arc<EventEntry>> = None;
        for conn in state.connections.values() {
            let Some(head) = conn.outbound.front() else {
                continue;
            };
            if !head.in_progress || !head.stream_open || !head.pointer_ids.is_empty() {
                continue;
            }
            let EventEntry::Motion(motion) = head.event.as_ref() else {
                continue;
            };
            if motion.device_id == event.device_id
                && motion.source == event.source
                && head.resolved_action == Some(event.action)
                && motion.pointer_properties.len() == event.pointer_coords.len()
            {
                shared = Some(Arc::clone(&head.event));
                break;
            }
        }
        let Some(shared) = shared else {
            return false;
        };

        if let EventEntry::Motion(motion) = shared.as_ref() {
            motion.append_sample(event.event_time, event.pointer_coords.clone());
        }
        trace!("Streaming motion sample onto in-flight event");

        let mut broken = Vec::new();
        for conn in state.connections.values_mut() {
            let channel = Arc::clone(&conn.channel);
            let Some(head) = conn.outbound.front_mut() else {
                continue;
            };
            if !head.in_progress || !Arc::ptr_eq(&head.event, &shared) || !head.stream_open {
                continue;
            }
            let coords: Vec<_> = event
                .pointer_coords
                .iter()
                .map(|c| c.offset(head.x_offset, head.y_offset))
                .collect();
            match channel.append_motion_sample(event.event_time, &coords) {
                Ok(()) => head.next_unsent_sample += 1,
                Err(TransportError::BufferFull) | Err(TransportError::AlreadyConsumed) => {
                    // The tail is re-dispatched once the consumer
                    // finishes the in-flight event.
                    head.stream_open = false;
                }
                Err(TransportError::Broken) => broken.push(channel.id()),
            }
        }
        let current_time = self.clock.now();
        for id in broken {
            self.abort_broken_dispatch_cycle(state, current_time, id, true);
        }
        true
    }

    /// Queue a configuration-change marker.
    pub fn notify_configuration_changed(&self, event_time: i64) {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        state
            .inbound
            .push_back(EventEntry::ConfigurationChanged(ConfigurationChangedEntry {
                seq,
                event_time,
            }));
        self.wake(&mut state);
    }

    /// Queue a device-reset marker; consumers holding state for the
    /// device receive synthesized cancels.
    pub fn notify_device_reset(&self, event_time: i64, device_id: i32) {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        state.inbound.push_back(EventEntry::DeviceReset(DeviceResetEntry {
            seq,
            event_time,
            device_id,
        }));
        self.wake(&mut state);
    }

    /// Forward a switch change straight to the policy.
    pub fn notify_switch(&self, event_time: i64, switch_code: i32, switch_value: i32) {
        self.policy.notify_switch(event_time, switch_code, switch_value);
    }

    /// Inject an event on behalf of an external process.
    pub fn inject_event(
        &self,
        event: &InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        mode: InjectionSyncMode,
        timeout: i64,
    ) -> InjectionResult {
        if let InputEvent::Motion(motion) = event {
            if let Err(problem) = motion.validate() {
                warn!(problem, "Rejecting malformed injected motion event");
                return InjectionResult::Failed;
            }
        }

        let trusted = self
            .policy
            .check_injection_permission(None, injector_pid, injector_uid);
        let mut policy_flags = PolicyFlags::INJECTED | PolicyFlags::PASS_TO_USER;
        if trusted {
            policy_flags |= PolicyFlags::TRUSTED;
        }
        match event {
            InputEvent::Key(key) => {
                self.policy.intercept_key_before_queueing(key, &mut policy_flags)
            }
            InputEvent::Motion(motion) => self
                .policy
                .intercept_generic_before_queueing(motion.event_time, &mut policy_flags),
        }
        if self.filter_swallowed(event, policy_flags) {
            // The filter consumed it on the injector's behalf.
            return InjectionResult::Succeeded;
        }

        let injection = Arc::new(InjectionState::new(injector_pid, injector_uid));
        let mut state = self.state.lock();
        let seq = state.next_seq();
        let entry = match event {
            InputEvent::Key(key) => {
                let mut entry = KeyEntry::from_event(seq, key, Some(Arc::clone(&injection)));
                entry.policy_flags = policy_flags;
                EventEntry::Key(entry)
            }
            InputEvent::Motion(motion) => {
                let mut entry = MotionEntry::from_event(seq, motion, Some(Arc::clone(&injection)));
                entry.policy_flags = policy_flags;
                EventEntry::Motion(entry)
            }
        };
        debug!(seq, injector_pid, injector_uid, ?mode, "Queued injected event");
        state.inbound.push_back(entry);
        self.wake(&mut state);

        if mode == InjectionSyncMode::None {
            return InjectionResult::Succeeded;
        }

        let deadline = Instant::now() + Duration::from_nanos(timeout.max(0) as u64);
        loop {
            match injection.result() {
                Some(result) => {
                    if result == InjectionResult::Succeeded
                        && mode == InjectionSyncMode::WaitForFinished
                    {
                        while injection.pending_dispatches() > 0 {
                            if self
                                .injection_finished
                                .wait_until(&mut state, deadline)
                                .timed_out()
                            {
                                return InjectionResult::TimedOut;
                            }
                        }
                    }
                    return result;
                }
                None => {
                    if self
                        .injection_result
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return InjectionResult::TimedOut;
                    }
                }
            }
        }
    }

    fn filter_swallowed(&self, event: &InputEvent, policy_flags: PolicyFlags) -> bool {
        let filter_enabled = self.state.lock().filter_enabled;
        if !filter_enabled || policy_flags.contains(PolicyFlags::FILTERED) {
            return false;
        }
        if self.policy.filter_input_event(event, policy_flags) {
            return false;
        }
        trace!("Input filter swallowed event");
        true
    }

    // --- consumer API ---

    /// Collect a consumer's finished signal and advance its queue.
    pub fn handle_finished_signal(&self, channel_id: u64) -> Result<()> {
        let (broken, commands): (bool, Vec<Command>) = {
            let mut state = self.state.lock();
            let channel = state
                .connections
                .get(&channel_id)
                .map(|c| Arc::clone(&c.channel))
                .ok_or(DispatchError::ChannelNotFound(channel_id))?;
            let current_time = self.clock.now();
            let broken = match channel.receive_finished_signal() {
                Ok(handled) => {
                    self.finish_dispatch_cycle(&mut state, current_time, channel_id, handled);
                    false
                }
                Err(_) => {
                    self.abort_broken_dispatch_cycle(&mut state, current_time, channel_id, true);
                    true
                }
            };
            state.wake_pending = true;
            (broken, state.commands.drain(..).collect())
        };
        self.looper.notify_all();
        self.run_commands(commands);
        if broken {
            return Err(DispatchError::ChannelBroken(channel_id));
        }
        Ok(())
    }

    // --- management API ---

    /// Register a consumer endpoint. Monitor channels receive a copy of
    /// every dispatched event.
    pub fn register_input_channel(
        &self,
        channel: Arc<dyn InputChannel>,
        monitor: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let id = channel.id();
        if state.connections.contains_key(&id) {
            return Err(DispatchError::ChannelExists(id));
        }
        info!(channel = channel.name(), id, monitor, "Registered input channel");
        state.connections.insert(id, Connection::new(channel, monitor));
        if monitor {
            state.monitors.push(id);
        }
        self.wake(&mut state);
        Ok(())
    }

    /// Unregister a consumer endpoint, discarding anything still queued
    /// for it.
    pub fn unregister_input_channel(&self, channel_id: u64) -> Result<()> {
        let mut injection_done = false;
        {
            let mut state = self.state.lock();
            let Some(conn) = state.connections.get_mut(&channel_id) else {
                return Err(DispatchError::ChannelNotFound(channel_id));
            };
            info!(channel = conn.name(), channel_id, "Unregistered input channel");
            conn.status = ConnectionStatus::Zombie;
            for entry in conn.outbound.drain(..) {
                if entry.target_flags.contains(targets::TargetFlags::FOREGROUND) {
                    if let Some(injection) = entry.event.injection() {
                        if injection.finish_pending_dispatch() == 0 {
                            injection_done = true;
                        }
                    }
                }
            }
            state.connections.remove(&channel_id);
            state.monitors.retain(|&id| id != channel_id);
            state.touch.remove_window(channel_id);
            if state.last_hover_channel == Some(channel_id) {
                state.last_hover_channel = None;
            }
            self.wake(&mut state);
        }
        if injection_done {
            self.injection_finished.notify_all();
        }
        Ok(())
    }

    /// Replace the window list (Z order, topmost first). Consumers that
    /// lose a gesture or focus mid-stream receive synthesized cancels.
    pub fn set_input_windows(&self, windows: Vec<InputWindow>) {
        let current_time = self.clock.now();
        let commands: Vec<Command> = {
            let mut state = self.state.lock();

            let removed_touched: Vec<u64> = state
                .touch
                .windows
                .iter()
                .map(|t| t.channel_id)
                .filter(|id| !windows.iter().any(|w| w.channel_id == *id))
                .collect();
            for channel_id in removed_touched {
                state.touch.remove_window(channel_id);
                self.synthesize_cancelation_events_for_connection(
                    &mut state,
                    current_time,
                    channel_id,
                    CancelScope::PointerEvents,
                    None,
                    "touched window was removed",
                );
            }

            let old_focus = state.windows.iter().find(|w| w.has_focus).map(|w| w.channel_id);
            let new_focus = windows.iter().find(|w| w.has_focus).map(|w| w.channel_id);
            if old_focus != new_focus {
                debug!(?old_focus, ?new_focus, "Focus changed");
                if let Some(old) = old_focus {
                    self.synthesize_cancelation_events_for_connection(
                        &mut state,
                        current_time,
                        old,
                        CancelScope::NonPointerEvents,
                        None,
                        "focus left the window",
                    );
                }
            }

            if state
                .last_hover_channel
                .is_some_and(|id| !windows.iter().any(|w| w.channel_id == id))
            {
                state.last_hover_channel = None;
            }

            state.windows = windows;
            state.wake_pending = true;
            state.commands.drain(..).collect()
        };
        self.looper.notify_all();
        self.run_commands(commands);
    }

    /// Set the application expected to take focus next; target
    /// resolution waits on it while it has no focused window.
    pub fn set_focused_application(&self, application: Option<InputApplication>) {
        let mut state = self.state.lock();
        state.focused_application = application;
        self.wake(&mut state);
    }

    /// Enable or disable dispatch, and freeze or thaw the loop.
    /// Disabling cancels everything consumers currently see as down.
    pub fn set_input_dispatch_mode(&self, enabled: bool, frozen: bool) {
        let current_time = self.clock.now();
        let commands: Vec<Command> = {
            let mut state = self.state.lock();
            info!(enabled, frozen, "Dispatch mode changed");
            let was_enabled = state.enabled;
            state.enabled = enabled;
            state.frozen = frozen;
            if was_enabled && !enabled {
                state.key_repeat = None;
                self.synthesize_cancelation_events_for_all_connections(
                    &mut state,
                    current_time,
                    CancelScope::All,
                    None,
                    "dispatch was disabled",
                );
                state.touch.reset();
            }
            state.wake_pending = true;
            state.commands.drain(..).collect()
        };
        self.looper.notify_all();
        self.run_commands(commands);
    }

    /// Toggle the input filter. Consumers are reset on any change so the
    /// filter never sees half a gesture.
    pub fn set_input_filter_enabled(&self, enabled: bool) {
        let current_time = self.clock.now();
        let commands: Vec<Command> = {
            let mut state = self.state.lock();
            if state.filter_enabled == enabled {
                return;
            }
            info!(enabled, "Input filter toggled");
            state.filter_enabled = enabled;
            self.synthesize_cancelation_events_for_all_connections(
                &mut state,
                current_time,
                CancelScope::All,
                None,
                "input filter was toggled",
            );
            state.wake_pending = true;
            state.commands.drain(..).collect()
        };
        self.looper.notify_all();
        self.run_commands(commands);
    }

    /// Hand the current gesture from one window to another, as when a
    /// drag leaves a launcher icon and becomes a window move.
    pub fn transfer_touch_focus(&self, from_channel_id: u64, to_channel_id: u64) -> bool {
        let current_time = self.clock.now();
        let commands: Vec<Command> = {
            let mut state = self.state.lock();
            let Some(index) = state
                .touch
                .windows
                .iter()
                .position(|t| t.channel_id == from_channel_id)
            else {
                debug!(from_channel_id, "Touch transfer refused, window is not touched");
                return false;
            };
            let touched = state.touch.windows.remove(index);
            state
                .touch
                .add_or_update_window(to_channel_id, touched.target_flags, touched.pointer_ids);

            // The destination must see a consistent stream, so it
            // inherits the source's tracked pointer state.
            if let Some(from_conn) = state.connections.remove(&from_channel_id) {
                if let Some(to_conn) = state.connections.get_mut(&to_channel_id) {
                    from_conn.input_state.copy_pointer_state_to(&mut to_conn.input_state);
                }
                state.connections.insert(from_channel_id, from_conn);
            }

            self.synthesize_cancelation_events_for_connection(
                &mut state,
                current_time,
                from_channel_id,
                CancelScope::PointerEvents,
                None,
                "touch focus transferred away",
            );
            debug!(from_channel_id, to_channel_id, "Touch focus transferred");
            state.wake_pending = true;
            state.commands.drain(..).collect()
        };
        self.looper.notify_all();
        self.run_commands(commands);
        true
    }

    fn wake(&self, state: &mut DispatchState) {
        state.wake_pending = true;
        self.looper.notify_all();
    }
}

/// Owns the blocking loop around [`Dispatcher::dispatch_once`].
pub struct DispatcherThread {
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherThread {
    /// Spawn the loop thread.
    pub fn start(dispatcher: Arc<Dispatcher>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                info!("Input dispatch thread started");
                while running.load(Ordering::Acquire) {
                    let next_wake = dispatcher.dispatch_once();
                    let mut state = dispatcher.state.lock();
                    if state.wake_pending {
                        state.wake_pending = false;
                        continue;
                    }
                    if next_wake <= 0 {
                        continue;
                    }
                    if next_wake == i64::MAX {
                        dispatcher.looper.wait(&mut state);
                    } else {
                        let now = dispatcher.clock.now();
                        if next_wake > now {
                            let timeout = Duration::from_nanos((next_wake - now) as u64);
                            dispatcher.looper.wait_for(&mut state, timeout);
                        }
                    }
                }
                info!("Input dispatch thread stopped");
            })
        };
        Self {
            dispatcher,
            running,
            handle: Some(handle),
        }
    }

    /// Stop the loop and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        {
            let mut state = self.dispatcher.state.lock();
            state.wake_pending = true;
        }
        self.dispatcher.looper.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
