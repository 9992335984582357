//! Dispatch cycles
//!
//! A dispatch cycle covers one event's trip through a connection:
//! enqueue on the outbound queue, publish through the channel, wait for
//! the consumer's finished signal, then start the next entry. Motion
//! entries stream additional samples onto the in-flight event until the
//! transport reports its buffer full; the unsent tail is re-dispatched
//! as a follow-up cycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::commands::Command;
use super::targets::{InputTarget, TargetFlags};
use super::{DispatchState, Dispatcher};
use crate::channel::{PublishedKey, PublishedMotion, TransportError};
use crate::connection::{ConnectionStatus, DispatchEntry};
use crate::event::entry::{EventEntry, KeyEntry, MotionEntry, MotionSample};
use crate::event::{
    KeyAction, KeyEvent, KeyFlags, MotionAction, MotionFlags, PointerCoords, PointerIdBits,
};
use crate::state::input_state::{CancelScope, TrackResult};

/// Per-target action once the dispatch mode is applied
fn resolve_motion_action(
    entry_action: MotionAction,
    flags: TargetFlags,
    consumer_is_hovering: bool,
) -> MotionAction {
    if flags.contains(TargetFlags::DISPATCH_OUTSIDE) {
        MotionAction::Outside
    } else if flags.contains(TargetFlags::DISPATCH_HOVER_EXIT) {
        MotionAction::HoverExit
    } else if flags.contains(TargetFlags::DISPATCH_HOVER_ENTER) {
        MotionAction::HoverEnter
    } else if flags.contains(TargetFlags::DISPATCH_SLIPPERY_EXIT) {
        MotionAction::Cancel
    } else if flags.contains(TargetFlags::DISPATCH_SLIPPERY_ENTER) {
        MotionAction::Down
    } else if entry_action == MotionAction::HoverMove && !consumer_is_hovering {
        // The consumer has not seen the hover begin yet.
        MotionAction::HoverEnter
    } else {
        entry_action
    }
}

/// Reduce a motion entry to the given pointers, remapping the action
pub(crate) fn split_motion_entry(
    entry: &MotionEntry,
    id_bits: PointerIdBits,
    seq: u64,
) -> Option<MotionEntry> {
    let kept: Vec<usize> = entry
        .pointer_properties
        .iter()
        .enumerate()
        .filter(|(_, p)| id_bits.has(p.id))
        .map(|(i, _)| i)
        .collect();
    if kept.is_empty() {
        return None;
    }

    let action = match entry.action {
        MotionAction::PointerDown(index) => {
            match kept.iter().position(|&i| i == index as usize) {
                Some(new_index) if kept.len() == 1 => {
                    debug_assert_eq!(new_index, 0);
                    MotionAction::Down
                }
                Some(new_index) => MotionAction::PointerDown(new_index as u8),
                // The pointer that went down belongs to another window.
                None => MotionAction::Move,
            }
        }
        MotionAction::PointerUp(index) => match kept.iter().position(|&i| i == index as usize) {
            Some(new_index) if kept.len() == 1 => {
                debug_assert_eq!(new_index, 0);
                MotionAction::Up
            }
            Some(new_index) => MotionAction::PointerUp(new_index as u8),
            None => MotionAction::Move,
        },
        other => other,
    };

    let properties = kept.iter().map(|&i| entry.pointer_properties[i]).collect();
    let samples: Vec<MotionSample> = entry
        .samples
        .lock()
        .iter()
        .map(|s| MotionSample {
            event_time: s.event_time,
            event_time_before_coalescing: s.event_time_before_coalescing,
            coords: kept.iter().filter_map(|&i| s.coords.get(i).copied()).collect(),
        })
        .collect();

    Some(MotionEntry {
        seq,
        event_time: entry.event_time,
        device_id: entry.device_id,
        source: entry.source,
        policy_flags: entry.policy_flags,
        injection: entry.injection.clone(),
        action,
        flags: entry.flags,
        meta_state: entry.meta_state,
        edge_flags: entry.edge_flags,
        x_precision: entry.x_precision,
        y_precision: entry.y_precision,
        down_time: entry.down_time,
        pointer_properties: properties,
        samples: Mutex::new(samples),
        dispatch_in_progress: false,
    })
}

/// Producer-shaped snapshot of a key entry, for policy callbacks
pub(crate) fn key_event_from_entry(entry: &KeyEntry) -> KeyEvent {
    KeyEvent {
        event_time: entry.event_time,
        device_id: entry.device_id,
        source: entry.source,
        policy_flags: entry.policy_flags,
        action: entry.action,
        flags: entry.flags,
        key_code: entry.key_code,
        scan_code: entry.scan_code,
        meta_state: entry.meta_state,
        repeat_count: entry.repeat_count,
        down_time: entry.down_time,
    }
}

impl Dispatcher {
    /// Fan an event out to its resolved targets.
    pub(crate) fn dispatch_event_to_targets(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        event: Arc<EventEntry>,
        targets: &[InputTarget],
    ) {
        for target in targets {
            self.prepare_dispatch_cycle(state, current_time, target, &event);
        }
    }

    /// Enqueue an event on one connection and start a cycle if the
    /// connection was idle.
    pub(crate) fn prepare_dispatch_cycle(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        target: &InputTarget,
        event: &Arc<EventEntry>,
    ) {
        let Some(conn) = state.connections.get(&target.channel_id) else {
            debug!(channel_id = target.channel_id, "Dropping dispatch, channel not registered");
            return;
        };
        if conn.status != ConnectionStatus::Normal {
            debug!(
                channel = conn.name(),
                status = ?conn.status,
                "Dropping dispatch, connection is not in a usable state"
            );
            return;
        }
        let was_empty = conn.outbound.is_empty();
        if self.enqueue_dispatch_entry(state, target, event) && was_empty {
            self.start_dispatch_cycle(state, current_time, target.channel_id);
        }
    }

    /// Resolve the per-target action, apply pointer splitting, track the
    /// consumer's input state, and push the dispatch entry. Returns
    /// whether anything was enqueued.
    fn enqueue_dispatch_entry(
        &self,
        state: &mut DispatchState,
        target: &InputTarget,
        event: &Arc<EventEntry>,
    ) -> bool {
        let DispatchState {
            connections,
            next_seq,
            ..
        } = state;
        let Some(conn) = connections.get_mut(&target.channel_id) else {
            return false;
        };

        match event.as_ref() {
            EventEntry::Key(key) => {
                if conn.input_state.track_key(key) == TrackResult::Inconsistent {
                    debug!(
                        channel = conn.name(),
                        key_code = key.key_code,
                        "Skipping inconsistent key event"
                    );
                    return false;
                }
                if let Some(injection) = &key.injection {
                    if target.flags.contains(TargetFlags::FOREGROUND) {
                        injection.add_pending_dispatch();
                    }
                }
                conn.outbound.push_back(DispatchEntry::new(
                    Arc::clone(event),
                    target.flags,
                    target.x_offset,
                    target.y_offset,
                    None,
                    PointerIdBits::EMPTY,
                    0,
                ));
                true
            }
            EventEntry::Motion(motion) => {
                let mut dispatch_event = Arc::clone(event);
                let mut entry_action = motion.action;
                let mut stream_open = true;

                if target.flags.contains(TargetFlags::SPLIT)
                    && !target.pointer_ids.is_empty()
                    && target.pointer_ids != motion.pointer_id_bits()
                {
                    *next_seq += 1;
                    let Some(split) = split_motion_entry(motion, target.pointer_ids, *next_seq)
                    else {
                        return false;
                    };
                    entry_action = split.action;
                    dispatch_event = Arc::new(EventEntry::Motion(split));
                    stream_open = false;
                }

                let hovering = conn.input_state.is_hovering(motion.device_id, motion.source);
                let resolved = resolve_motion_action(entry_action, target.flags, hovering);

                let dispatch_motion = match dispatch_event.as_ref() {
                    EventEntry::Motion(m) => m,
                    _ => unreachable!(),
                };
                if conn.input_state.track_motion(dispatch_motion, resolved)
                    == TrackResult::Inconsistent
                {
                    debug!(
                        channel = conn.name(),
                        ?resolved,
                        "Skipping inconsistent motion event"
                    );
                    return false;
                }
                if let Some(injection) = &motion.injection {
                    if target.flags.contains(TargetFlags::FOREGROUND) {
                        injection.add_pending_dispatch();
                    }
                }

                let mut entry = DispatchEntry::new(
                    dispatch_event,
                    target.flags,
                    target.x_offset,
                    target.y_offset,
                    Some(resolved),
                    target.pointer_ids,
                    0,
                );
                entry.stream_open = stream_open && resolved.can_batch();
                conn.outbound.push_back(entry);
                true
            }
            _ => false,
        }
    }

    /// Publish the head of a connection's outbound queue.
    pub(crate) fn start_dispatch_cycle(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        channel_id: u64,
    ) {
        let mut broken = false;
        {
            let Some(conn) = state.connections.get_mut(&channel_id) else {
                return;
            };
            if conn.status != ConnectionStatus::Normal {
                return;
            }
            let Some(head) = conn.outbound.front_mut() else {
                return;
            };
            if head.in_progress {
                return;
            }

            let event_time = head.event.event_time();
            match head.event.as_ref() {
                EventEntry::Key(key) => {
                    let published = PublishedKey {
                        device_id: key.device_id,
                        source: key.source,
                        action: key.action,
                        flags: key.flags,
                        key_code: key.key_code,
                        scan_code: key.scan_code,
                        meta_state: key.meta_state,
                        repeat_count: key.repeat_count,
                        down_time: key.down_time,
                        event_time: key.event_time,
                    };
                    if conn.channel.publish_key(&published).is_err() {
                        warn!(channel = conn.name(), "Failed to publish key event");
                        broken = true;
                    }
                }
                EventEntry::Motion(motion) => {
                    let samples = motion.samples.lock().clone();
                    let Some(first) = samples.get(head.head_sample) else {
                        conn.outbound.pop_front();
                        return;
                    };
                    let zero = head.target_flags.contains(TargetFlags::ZERO_COORDS);
                    let (x_offset, y_offset) = if zero {
                        (0.0, 0.0)
                    } else {
                        (head.x_offset, head.y_offset)
                    };
                    let project = |coords: &[PointerCoords]| -> Vec<PointerCoords> {
                        if zero {
                            vec![PointerCoords::default(); coords.len()]
                        } else {
                            coords.iter().map(|c| c.offset(x_offset, y_offset)).collect()
                        }
                    };
                    let mut flags = motion.flags;
                    if head
                        .target_flags
                        .contains(TargetFlags::WINDOW_IS_OBSCURED)
                    {
                        flags |= MotionFlags::WINDOW_IS_OBSCURED;
                    }
                    let action = head.resolved_action.unwrap_or(motion.action);
                    let published = PublishedMotion {
                        device_id: motion.device_id,
                        source: motion.source,
                        action,
                        flags,
                        edge_flags: motion.edge_flags,
                        meta_state: motion.meta_state,
                        x_offset,
                        y_offset,
                        x_precision: motion.x_precision,
                        y_precision: motion.y_precision,
                        down_time: motion.down_time,
                        event_time: first.event_time,
                        pointer_properties: motion.pointer_properties.clone(),
                        pointer_coords: project(&first.coords),
                    };
                    if conn.channel.publish_motion(&published).is_err() {
                        warn!(channel = conn.name(), "Failed to publish motion event");
                        broken = true;
                    } else {
                        head.next_unsent_sample = head.head_sample + 1;
                        for sample in &samples[head.head_sample + 1..] {
                            match conn
                                .channel
                                .append_motion_sample(sample.event_time, &project(&sample.coords))
                            {
                                Ok(()) => head.next_unsent_sample += 1,
                                Err(TransportError::BufferFull)
                                | Err(TransportError::AlreadyConsumed) => {
                                    // Keep the tail for a follow-up cycle.
                                    head.stream_open = false;
                                    break;
                                }
                                Err(TransportError::Broken) => {
                                    broken = true;
                                    break;
                                }
                            }
                        }
                    }
                }
                _ => {
                    // Marker entries never reach a connection.
                    conn.outbound.pop_front();
                    return;
                }
            }

            if !broken {
                let Some(head) = conn.outbound.front_mut() else {
                    return;
                };
                head.in_progress = true;
                conn.last_event_time = event_time;
                conn.last_dispatch_time = current_time;
                if conn.channel.send_dispatch_signal().is_err() {
                    warn!(channel = conn.name(), "Failed to signal consumer");
                    broken = true;
                }
            }
        }
        if broken {
            self.abort_broken_dispatch_cycle(state, current_time, channel_id, true);
        }
    }

    /// Handle a consumer's finished signal: retire the in-flight entry,
    /// run fallback-key bookkeeping, re-dispatch any unsent sample tail,
    /// and start the next cycle.
    pub(crate) fn finish_dispatch_cycle(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        channel_id: u64,
        handled: bool,
    ) {
        let mut cancel_fallback = false;
        let mut unhandled_key: Option<KeyEvent> = None;
        let mut injection_done = false;
        {
            let Some(conn) = state.connections.get_mut(&channel_id) else {
                return;
            };
            if conn.status == ConnectionStatus::Broken {
                return;
            }
            if !conn.outbound.front().is_some_and(|e| e.in_progress) {
                debug!(channel = conn.name(), "Spurious finished signal");
                return;
            }
            let entry = match conn.outbound.pop_front() {
                Some(entry) => entry,
                None => return,
            };

            if entry.target_flags.contains(TargetFlags::FOREGROUND) {
                if let Some(injection) = entry.event.injection() {
                    if injection.finish_pending_dispatch() == 0 {
                        injection_done = true;
                    }
                }
            }

            if let EventEntry::Key(key) = entry.event.as_ref() {
                if !key.flags.contains(KeyFlags::FALLBACK) {
                    let latched = conn.input_state.fallback_key_for(key.key_code).is_some();
                    if !handled {
                        // Consult the policy only on the initial down of
                        // a key, or while a fallback is already latched
                        // for it; an unhandled repeat must not latch a
                        // fallback mid-stream.
                        let initial_down = key.action == KeyAction::Down
                            && key.repeat_count == 0
                            && !key.flags.contains(KeyFlags::CANCELED);
                        if initial_down || latched {
                            unhandled_key = Some(key_event_from_entry(key));
                        }
                    } else if key.action == KeyAction::Up && latched {
                        // The app handled the original key after all.
                        conn.input_state.remove_fallback_key(key.key_code);
                        cancel_fallback = true;
                    }
                }
            }

            if entry.has_unsent_tail() {
                let resumed_action = match entry.resolved_action {
                    Some(MotionAction::HoverMove) | Some(MotionAction::HoverEnter) => {
                        Some(MotionAction::HoverMove)
                    }
                    _ => Some(MotionAction::Move),
                };
                let mut resumed = DispatchEntry::new(
                    Arc::clone(&entry.event),
                    entry.target_flags,
                    entry.x_offset,
                    entry.y_offset,
                    resumed_action,
                    entry.pointer_ids,
                    entry.next_unsent_sample,
                );
                resumed.stream_open = false;
                conn.outbound.push_front(resumed);
            }
        }

        if injection_done {
            self.injection_finished.notify_all();
        }
        if cancel_fallback {
            self.synthesize_cancelation_events_for_connection(
                state,
                current_time,
                channel_id,
                CancelScope::FallbackKeys,
                None,
                "application handled the original key",
            );
        }
        if let Some(event) = unhandled_key {
            state
                .commands
                .push_back(Command::DispatchUnhandledKey { channel_id, event });
        }

        let has_next = state
            .connections
            .get(&channel_id)
            .is_some_and(|c| c.outbound.front().is_some_and(|e| !e.in_progress));
        if has_next {
            self.start_dispatch_cycle(state, current_time, channel_id);
        }
    }

    /// Drain a connection that can no longer deliver and mark it broken.
    pub(crate) fn abort_broken_dispatch_cycle(
        &self,
        state: &mut DispatchState,
        _current_time: i64,
        channel_id: u64,
        notify: bool,
    ) {
        let mut injection_done = false;
        let mut post_notify = false;
        {
            let Some(conn) = state.connections.get_mut(&channel_id) else {
                return;
            };
            warn!(channel = conn.name(), "Aborting dispatch cycles, channel is broken");
            for entry in conn.outbound.drain(..) {
                if entry.target_flags.contains(TargetFlags::FOREGROUND) {
                    if let Some(injection) = entry.event.injection() {
                        if injection.finish_pending_dispatch() == 0 {
                            injection_done = true;
                        }
                    }
                }
            }
            if conn.status == ConnectionStatus::Normal {
                conn.status = ConnectionStatus::Broken;
                post_notify = notify;
            }
        }
        if injection_done {
            self.injection_finished.notify_all();
        }
        if post_notify {
            state.commands.push_back(Command::NotifyBroken { channel_id });
        }
    }

    /// Synthesize and enqueue cancel events for one connection.
    pub(crate) fn synthesize_cancelation_events_for_connection(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        channel_id: u64,
        scope: CancelScope,
        device_id: Option<i32>,
        reason: &str,
    ) {
        let was_empty;
        {
            let DispatchState {
                connections,
                next_seq,
                windows,
                ..
            } = state;
            let Some(conn) = connections.get_mut(&channel_id) else {
                return;
            };
            if conn.status != ConnectionStatus::Normal {
                return;
            }
            let events = conn.input_state.synthesize_cancelation_events(
                current_time,
                scope,
                device_id,
                || {
                    *next_seq += 1;
                    *next_seq
                },
            );
            if events.is_empty() {
                return;
            }
            debug!(
                channel = conn.name(),
                count = events.len(),
                reason,
                "Canceling events"
            );
            let (x_offset, y_offset) = windows
                .iter()
                .find(|w| w.channel_id == channel_id)
                .map(|w| (-w.frame.left, -w.frame.top))
                .unwrap_or((0.0, 0.0));
            was_empty = conn.outbound.is_empty();
            for event in events {
                let resolved = match &event {
                    EventEntry::Motion(m) => Some(m.action),
                    _ => None,
                };
                let mut entry = DispatchEntry::new(
                    Arc::new(event),
                    TargetFlags::DISPATCH_AS_IS,
                    x_offset,
                    y_offset,
                    resolved,
                    PointerIdBits::EMPTY,
                    0,
                );
                entry.stream_open = false;
                conn.outbound.push_back(entry);
            }
        }
        if was_empty {
            self.start_dispatch_cycle(state, current_time, channel_id);
        }
    }

    /// Synthesize cancel events on every connection.
    pub(crate) fn synthesize_cancelation_events_for_all_connections(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        scope: CancelScope,
        device_id: Option<i32>,
        reason: &str,
    ) {
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            self.synthesize_cancelation_events_for_connection(
                state,
                current_time,
                id,
                scope,
                device_id,
                reason,
            );
        }
    }

    /// Dispatch a policy-supplied fallback key directly to a connection.
    pub(crate) fn dispatch_fallback_key(
        &self,
        state: &mut DispatchState,
        current_time: i64,
        channel_id: u64,
        mut event: KeyEvent,
    ) {
        event.flags |= KeyFlags::FALLBACK;
        state.next_seq += 1;
        let entry = Arc::new(EventEntry::Key(KeyEntry::from_event(
            state.next_seq,
            &event,
            None,
        )));
        let target = InputTarget {
            channel_id,
            flags: TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
            x_offset: 0.0,
            y_offset: 0.0,
            pointer_ids: PointerIdBits::EMPTY,
        };
        self.prepare_dispatch_cycle(state, current_time, &target, &entry);
    }
}
