//! Per-connection input state and cancellation synthesis
//!
//! Each connection tracks the keys and gestures its consumer has
//! observed going down. When the stream to that consumer must stop
//! early (window removed, channel broken, ANR give-up, dispatch
//! disabled) the tracked state is replayed as cancel events so the
//! consumer never sees a gesture with no ending.

use std::collections::HashMap;

use tracing::debug;

use crate::event::entry::{EventEntry, KeyEntry, MotionEntry};
use crate::event::{
    KeyAction, KeyFlags, MotionAction, PointerCoords, PointerProperties, PolicyFlags, Source,
};

/// Which tracked state a cancellation sweep covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Cancel every tracked key and gesture
    All,
    /// Cancel gestures from pointer-class sources only
    PointerEvents,
    /// Cancel keys and non-pointer gestures only
    NonPointerEvents,
    /// Cancel only keys that were synthesized as fallbacks
    FallbackKeys,
}

/// Whether an event is consistent with the tracked state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackResult {
    /// Event fits the tracked state and should be dispatched
    Consistent,
    /// Event contradicts the tracked state (for example an up with no
    /// matching down) and must not be dispatched to this consumer
    Inconsistent,
}

/// A key the consumer currently believes is down
#[derive(Debug, Clone)]
struct KeyMemento {
    device_id: i32,
    source: Source,
    key_code: i32,
    scan_code: i32,
    meta_state: u32,
    flags: KeyFlags,
    down_time: i64,
    policy_flags: PolicyFlags,
}

/// A gesture the consumer currently believes is in progress
#[derive(Debug, Clone)]
struct MotionMemento {
    device_id: i32,
    source: Source,
    x_precision: f32,
    y_precision: f32,
    down_time: i64,
    hovering: bool,
    policy_flags: PolicyFlags,
    pointer_properties: Vec<PointerProperties>,
    pointer_coords: Vec<PointerCoords>,
}

impl MotionMemento {
    fn update_from(&mut self, entry: &MotionEntry, hovering: bool) {
        self.pointer_properties = entry.pointer_properties.clone();
        self.pointer_coords = entry
            .samples
            .lock()
            .last()
            .map(|s| s.coords.clone())
            .unwrap_or_default();
        self.hovering = hovering;
    }
}

/// Tracked down-state for one connection
#[derive(Debug, Default)]
pub struct InputState {
    key_mementos: Vec<KeyMemento>,
    motion_mementos: Vec<MotionMemento>,
    fallback_keys: HashMap<i32, i32>,
}

impl InputState {
    /// New empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is tracked as down
    pub fn is_neutral(&self) -> bool {
        self.key_mementos.is_empty() && self.motion_mementos.is_empty()
    }

    /// Record a key event about to be dispatched to this connection
    pub fn track_key(&mut self, entry: &KeyEntry) -> TrackResult {
        let index = self.key_mementos.iter().position(|m| {
            m.device_id == entry.device_id
                && m.source == entry.source
                && m.key_code == entry.key_code
                && m.scan_code == entry.scan_code
        });
        match entry.action {
            KeyAction::Up => match index {
                Some(i) => {
                    self.key_mementos.remove(i);
                    TrackResult::Consistent
                }
                None => TrackResult::Inconsistent,
            },
            KeyAction::Down => {
                if index.is_none() {
                    self.key_mementos.push(KeyMemento {
                        device_id: entry.device_id,
                        source: entry.source,
                        key_code: entry.key_code,
                        scan_code: entry.scan_code,
                        meta_state: entry.meta_state,
                        flags: entry.flags,
                        down_time: entry.down_time,
                        policy_flags: entry.policy_flags,
                    });
                }
                TrackResult::Consistent
            }
        }
    }

    /// Record a motion event about to be dispatched to this connection.
    /// `action` is the per-target resolved action, which may differ from
    /// the entry's own.
    pub fn track_motion(&mut self, entry: &MotionEntry, action: MotionAction) -> TrackResult {
        if matches!(action, MotionAction::Scroll | MotionAction::Outside) {
            return TrackResult::Consistent;
        }
        let index = self
            .motion_mementos
            .iter()
            .position(|m| m.device_id == entry.device_id && m.source == entry.source);
        match action {
            MotionAction::Up | MotionAction::Cancel => match index {
                Some(i) => {
                    self.motion_mementos.remove(i);
                    TrackResult::Consistent
                }
                None => TrackResult::Inconsistent,
            },
            MotionAction::HoverExit => match index {
                Some(i) if self.motion_mementos[i].hovering => {
                    self.motion_mementos.remove(i);
                    TrackResult::Consistent
                }
                _ => TrackResult::Inconsistent,
            },
            MotionAction::Down => {
                self.put_motion_memento(index, entry, false);
                TrackResult::Consistent
            }
            MotionAction::HoverEnter | MotionAction::HoverMove => {
                self.put_motion_memento(index, entry, true);
                TrackResult::Consistent
            }
            MotionAction::Move | MotionAction::PointerDown(_) | MotionAction::PointerUp(_) => {
                match index {
                    Some(i) => {
                        let hovering = self.motion_mementos[i].hovering;
                        self.motion_mementos[i].update_from(entry, hovering);
                        TrackResult::Consistent
                    }
                    None => TrackResult::Inconsistent,
                }
            }
            MotionAction::Scroll | MotionAction::Outside => TrackResult::Consistent,
        }
    }

    fn put_motion_memento(&mut self, index: Option<usize>, entry: &MotionEntry, hovering: bool) {
        let memento = MotionMemento {
            device_id: entry.device_id,
            source: entry.source,
            x_precision: entry.x_precision,
            y_precision: entry.y_precision,
            down_time: entry.down_time,
            hovering,
            policy_flags: entry.policy_flags,
            pointer_properties: entry.pointer_properties.clone(),
            pointer_coords: entry
                .samples
                .lock()
                .last()
                .map(|s| s.coords.clone())
                .unwrap_or_default(),
        };
        match index {
            Some(i) => self.motion_mementos[i] = memento,
            None => self.motion_mementos.push(memento),
        }
    }

    /// Whether the consumer is currently tracking a hovering gesture
    /// from the given device and source
    pub fn is_hovering(&self, device_id: i32, source: Source) -> bool {
        self.motion_mementos
            .iter()
            .any(|m| m.device_id == device_id && m.source == source && m.hovering)
    }

    /// Synthesize cancel events for tracked state in scope, clearing the
    /// state as it goes. `device_id` narrows the sweep to one device.
    /// Sequence numbers come from `next_seq`.
    pub fn synthesize_cancelation_events(
        &mut self,
        current_time: i64,
        scope: CancelScope,
        device_id: Option<i32>,
        mut next_seq: impl FnMut() -> u64,
    ) -> Vec<EventEntry> {
        let mut events = Vec::new();

        let key_in_scope = |m: &KeyMemento| {
            if device_id.is_some_and(|d| d != m.device_id) {
                return false;
            }
            match scope {
                CancelScope::All | CancelScope::NonPointerEvents => true,
                CancelScope::PointerEvents => false,
                CancelScope::FallbackKeys => m.flags.contains(KeyFlags::FALLBACK),
            }
        };
        let mut i = 0;
        while i < self.key_mementos.len() {
            if key_in_scope(&self.key_mementos[i]) {
                let m = self.key_mementos.remove(i);
                events.push(EventEntry::Key(KeyEntry {
                    seq: next_seq(),
                    event_time: current_time,
                    device_id: m.device_id,
                    source: m.source,
                    policy_flags: m.policy_flags,
                    injection: None,
                    action: KeyAction::Up,
                    flags: m.flags | KeyFlags::CANCELED,
                    key_code: m.key_code,
                    scan_code: m.scan_code,
                    meta_state: m.meta_state,
                    repeat_count: 0,
                    down_time: m.down_time,
                    intercept: None,
                    dispatch_in_progress: false,
                }));
            } else {
                i += 1;
            }
        }

        let motion_in_scope = |m: &MotionMemento| {
            if device_id.is_some_and(|d| d != m.device_id) {
                return false;
            }
            match scope {
                CancelScope::All => true,
                CancelScope::PointerEvents => m.source.is_pointer(),
                CancelScope::NonPointerEvents => !m.source.is_pointer(),
                CancelScope::FallbackKeys => false,
            }
        };
        let mut i = 0;
        while i < self.motion_mementos.len() {
            if motion_in_scope(&self.motion_mementos[i]) {
                let m = self.motion_mementos.remove(i);
                let action = if m.hovering {
                    MotionAction::HoverExit
                } else {
                    MotionAction::Cancel
                };
                events.push(EventEntry::Motion(MotionEntry {
                    seq: next_seq(),
                    event_time: current_time,
                    device_id: m.device_id,
                    source: m.source,
                    policy_flags: m.policy_flags,
                    injection: None,
                    action,
                    flags: crate::event::MotionFlags::empty(),
                    meta_state: 0,
                    edge_flags: 0,
                    x_precision: m.x_precision,
                    y_precision: m.y_precision,
                    down_time: m.down_time,
                    pointer_properties: m.pointer_properties.clone(),
                    samples: parking_lot::Mutex::new(vec![
                        crate::event::entry::MotionSample {
                            event_time: current_time,
                            event_time_before_coalescing: current_time,
                            coords: m.pointer_coords.clone(),
                        },
                    ]),
                    dispatch_in_progress: false,
                }));
            } else {
                i += 1;
            }
        }

        if !events.is_empty() {
            debug!(count = events.len(), ?scope, "Synthesized cancelation events");
        }
        events
    }

    /// Copy pointer-class gesture state into another connection's state,
    /// replacing any same-device entries there
    pub fn copy_pointer_state_to(&self, other: &mut InputState) {
        for memento in self.motion_mementos.iter().filter(|m| m.source.is_pointer()) {
            other
                .motion_mementos
                .retain(|m| !(m.device_id == memento.device_id && m.source == memento.source));
            other.motion_mementos.push(memento.clone());
        }
    }

    /// Remember that `fallback_key` was dispatched in place of
    /// `original_key`
    pub fn set_fallback_key(&mut self, original_key: i32, fallback_key: i32) {
        self.fallback_keys.insert(original_key, fallback_key);
    }

    /// Forget the fallback mapping for `original_key`
    pub fn remove_fallback_key(&mut self, original_key: i32) {
        self.fallback_keys.remove(&original_key);
    }

    /// Fallback key currently latched for `original_key`
    pub fn fallback_key_for(&self, original_key: i32) -> Option<i32> {
        self.fallback_keys.get(&original_key).copied()
    }
}
