//! Deferred policy commands
//!
//! Policy callbacks are never made with the dispatcher lock held.
//! Anything the dispatch loop wants from the policy is queued as a
//! command under the lock, drained after the lock is released, and the
//! reply is applied under a fresh lock.

use tracing::debug;

use super::Dispatcher;
use crate::event::{KeyAction, KeyEvent};
use crate::state::input_state::CancelScope;

/// A policy call queued for execution outside the dispatcher lock
#[derive(Debug)]
pub(crate) enum Command {
    /// Ask the policy whether the focused window should see a key
    InterceptKeyBeforeDispatching {
        /// Focused channel at the time of the question
        channel_id: Option<u64>,
        /// Sequence number of the parked key entry
        seq: u64,
        /// Snapshot of the key
        event: KeyEvent,
    },
    /// Report a target that is not responding
    NotifyAnr {
        /// Application being waited on, if known
        application: Option<String>,
        /// Channel being waited on, if known
        channel_id: Option<u64>,
    },
    /// Report a channel that broke
    NotifyBroken {
        /// The broken channel
        channel_id: u64,
    },
    /// Offer an unhandled key back to the policy for a fallback
    DispatchUnhandledKey {
        /// Consumer that did not handle the key
        channel_id: u64,
        /// Snapshot of the unhandled key
        event: KeyEvent,
    },
    /// Reset user idle timers
    PokeUserActivity {
        /// Event time that proves activity
        event_time: i64,
        /// Kind of activity, see `policy::USER_ACTIVITY_EVENT_*`
        event_type: u32,
    },
    /// An app-switch key was released
    NotifySwitch {
        /// Release time
        event_time: i64,
        /// Key code of the switch key
        switch_code: i32,
        /// 1 for release
        switch_value: i32,
    },
    /// A configuration-change marker reached the head of the queue
    NotifyConfigurationChanged {
        /// Time of the change
        event_time: i64,
    },
}

impl Dispatcher {
    /// Run drained commands with the lock released, then apply replies.
    pub(crate) fn run_commands(&self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::InterceptKeyBeforeDispatching {
                    channel_id,
                    seq,
                    event,
                } => {
                    let result = self
                        .policy
                        .intercept_key_before_dispatching(channel_id, &event);
                    debug!(seq, ?result, "Key intercept verdict");
                    let mut state = self.state.lock();
                    if let Some(crate::event::entry::EventEntry::Key(pending)) =
                        state.pending.as_mut()
                    {
                        if pending.seq == seq {
                            pending.intercept = Some(result);
                        }
                    }
                    state.wake_pending = true;
                    self.looper.notify_all();
                }
                Command::NotifyAnr {
                    application,
                    channel_id,
                } => {
                    let new_timeout = self.policy.notify_anr(application.as_deref(), channel_id);
                    let current_time = self.clock.now();
                    let mut state = self.state.lock();
                    self.resume_after_targets_not_ready(&mut state, current_time, new_timeout);
                    state.wake_pending = true;
                    self.looper.notify_all();
                }
                Command::NotifyBroken { channel_id } => {
                    self.policy.notify_input_channel_broken(channel_id);
                }
                Command::DispatchUnhandledKey { channel_id, event } => {
                    let fallback = self.policy.dispatch_unhandled_key(Some(channel_id), &event);
                    let current_time = self.clock.now();
                    let mut state = self.state.lock();
                    self.apply_fallback_key(&mut state, current_time, channel_id, &event, fallback);
                    state.wake_pending = true;
                    self.looper.notify_all();
                }
                Command::PokeUserActivity {
                    event_time,
                    event_type,
                } => {
                    self.policy.poke_user_activity(event_time, event_type);
                }
                Command::NotifySwitch {
                    event_time,
                    switch_code,
                    switch_value,
                } => {
                    self.policy
                        .notify_switch(event_time, switch_code, switch_value);
                }
                Command::NotifyConfigurationChanged { event_time } => {
                    self.policy.notify_configuration_changed(event_time);
                }
            }
        }
    }

    /// Apply the policy's fallback-key answer for an unhandled key.
    fn apply_fallback_key(
        &self,
        state: &mut super::DispatchState,
        current_time: i64,
        channel_id: u64,
        original: &KeyEvent,
        fallback: Option<KeyEvent>,
    ) {
        let Some(conn) = state.connections.get(&channel_id) else {
            return;
        };
        if conn.status != crate::connection::ConnectionStatus::Normal {
            return;
        }
        match (original.action, fallback) {
            (KeyAction::Down, Some(fallback)) => {
                debug!(
                    original = original.key_code,
                    fallback = fallback.key_code,
                    "Latching fallback key"
                );
                if let Some(conn) = state.connections.get_mut(&channel_id) {
                    conn.input_state
                        .set_fallback_key(original.key_code, fallback.key_code);
                }
                self.dispatch_fallback_key(state, current_time, channel_id, fallback);
            }
            (KeyAction::Up, fallback) => {
                let latched = state
                    .connections
                    .get(&channel_id)
                    .and_then(|c| c.input_state.fallback_key_for(original.key_code));
                if let Some(conn) = state.connections.get_mut(&channel_id) {
                    conn.input_state.remove_fallback_key(original.key_code);
                }
                match (latched, fallback) {
                    (Some(latched_code), Some(fallback))
                        if latched_code == fallback.key_code =>
                    {
                        self.dispatch_fallback_key(state, current_time, channel_id, fallback);
                    }
                    (Some(_), _) => {
                        // The latched fallback no longer matches; end it
                        // cleanly instead of leaving it stuck down.
                        self.synthesize_cancelation_events_for_connection(
                            state,
                            current_time,
                            channel_id,
                            CancelScope::FallbackKeys,
                            None,
                            "fallback key changed",
                        );
                    }
                    (None, Some(fallback)) => {
                        self.dispatch_fallback_key(state, current_time, channel_id, fallback);
                    }
                    (None, None) => {}
                }
            }
            (KeyAction::Down, None) => {}
        }
    }
}
