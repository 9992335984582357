//! Internal queue entries
//!
//! Events are converted into entries when they enter the inbound queue.
//! An entry is owned by the queue until dispatch, then shared via `Arc`
//! with every consumer's outbound queue. Motion entries hold an
//! append-only sample vector so later samples can stream onto an entry
//! that is already in flight.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent, MotionFlags, PointerCoords,
    PointerIdBits, PointerProperties, PolicyFlags, Source,
};
use crate::policy::InterceptResult;

/// Outcome of an event injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionResult {
    /// Event was dispatched (or consumed by the policy on the injector's
    /// behalf)
    Succeeded,
    /// Event could not be dispatched
    Failed,
    /// Synchronous injection did not complete within the deadline
    TimedOut,
    /// Injector lacks permission to target the affected window
    PermissionDenied,
}

/// Progress shared between an injected entry and the injecting thread
#[derive(Debug)]
pub struct InjectionState {
    /// Process id of the injector
    pub injector_pid: i32,
    /// User id of the injector
    pub injector_uid: i32,
    progress: Mutex<InjectionProgress>,
}

#[derive(Debug)]
struct InjectionProgress {
    result: Option<InjectionResult>,
    pending_foreground_dispatches: u32,
}

impl InjectionState {
    /// New pending injection for the given injector
    pub fn new(injector_pid: i32, injector_uid: i32) -> Self {
        Self {
            injector_pid,
            injector_uid,
            progress: Mutex::new(InjectionProgress {
                result: None,
                pending_foreground_dispatches: 0,
            }),
        }
    }

    /// Record the injection result; the first result sticks
    pub fn set_result(&self, result: InjectionResult) {
        let mut progress = self.progress.lock();
        if progress.result.is_none() {
            progress.result = Some(result);
        }
    }

    /// Result if one has been recorded
    pub fn result(&self) -> Option<InjectionResult> {
        self.progress.lock().result
    }

    /// Count one more foreground dispatch the injector must wait for
    pub fn add_pending_dispatch(&self) {
        self.progress.lock().pending_foreground_dispatches += 1;
    }

    /// Finish one foreground dispatch, returning the remaining count
    pub fn finish_pending_dispatch(&self) -> u32 {
        let mut progress = self.progress.lock();
        progress.pending_foreground_dispatches =
            progress.pending_foreground_dispatches.saturating_sub(1);
        progress.pending_foreground_dispatches
    }

    /// Dispatches the injector is still waiting on
    pub fn pending_dispatches(&self) -> u32 {
        self.progress.lock().pending_foreground_dispatches
    }
}

/// One motion sample within a batched motion entry
#[derive(Debug, Clone)]
pub struct MotionSample {
    /// Sample time after coalescing
    pub event_time: i64,
    /// Original sample time before coalescing folded it
    pub event_time_before_coalescing: i64,
    /// Per-pointer coordinates, parallel to the entry's properties
    pub coords: Vec<PointerCoords>,
}

/// Configuration-change marker entry
#[derive(Debug)]
pub struct ConfigurationChangedEntry {
    /// Queue sequence number
    pub seq: u64,
    /// Time of the change
    pub event_time: i64,
}

/// Device removal or reset marker entry
#[derive(Debug)]
pub struct DeviceResetEntry {
    /// Queue sequence number
    pub seq: u64,
    /// Time of the reset
    pub event_time: i64,
    /// Device that went away
    pub device_id: i32,
}

/// Key event entry
#[derive(Debug, Clone)]
pub struct KeyEntry {
    /// Queue sequence number
    pub seq: u64,
    /// Time the key state changed
    pub event_time: i64,
    /// Originating device
    pub device_id: i32,
    /// Source class
    pub source: Source,
    /// Reader / policy flags
    pub policy_flags: PolicyFlags,
    /// Injection progress when this entry was injected
    pub injection: Option<Arc<InjectionState>>,
    /// Press or release
    pub action: KeyAction,
    /// Key flags
    pub flags: KeyFlags,
    /// Logical key code
    pub key_code: i32,
    /// Hardware scan code
    pub scan_code: i32,
    /// Modifier state
    pub meta_state: u32,
    /// Repeat count (0 for the initial press)
    pub repeat_count: u32,
    /// Time of the initial press
    pub down_time: i64,
    /// Result of the pre-dispatch policy intercept; `None` until the
    /// deferred policy call completes
    pub intercept: Option<InterceptResult>,
    /// Set once dispatch bookkeeping (repeat tracking, logging) ran so
    /// re-entry after a deferred policy call does not repeat it
    pub dispatch_in_progress: bool,
}

impl KeyEntry {
    /// Build an entry from a producer event
    pub fn from_event(seq: u64, event: &KeyEvent, injection: Option<Arc<InjectionState>>) -> Self {
        Self {
            seq,
            event_time: event.event_time,
            device_id: event.device_id,
            source: event.source,
            policy_flags: event.policy_flags,
            injection,
            action: event.action,
            flags: event.flags,
            key_code: event.key_code,
            scan_code: event.scan_code,
            meta_state: event.meta_state,
            repeat_count: event.repeat_count,
            down_time: event.down_time,
            intercept: None,
            dispatch_in_progress: false,
        }
    }

    /// Synthetic repeat of this entry at the given time
    pub fn make_repeat(&self, seq: u64, event_time: i64) -> KeyEntry {
        let mut flags = self.flags;
        let repeat_count = self.repeat_count + 1;
        if repeat_count == 1 {
            flags |= KeyFlags::LONG_PRESS;
        }
        KeyEntry {
            seq,
            event_time,
            repeat_count,
            flags,
            injection: None,
            intercept: None,
            dispatch_in_progress: false,
            ..self.clone()
        }
    }
}

/// Motion event entry with its sample batch
#[derive(Debug)]
pub struct MotionEntry {
    /// Queue sequence number
    pub seq: u64,
    /// Time of the first sample
    pub event_time: i64,
    /// Originating device
    pub device_id: i32,
    /// Source class
    pub source: Source,
    /// Reader / policy flags
    pub policy_flags: PolicyFlags,
    /// Injection progress when this entry was injected
    pub injection: Option<Arc<InjectionState>>,
    /// Motion action
    pub action: MotionAction,
    /// Motion flags
    pub flags: MotionFlags,
    /// Modifier state
    pub meta_state: u32,
    /// Display edges the gesture started on
    pub edge_flags: u32,
    /// X axis precision
    pub x_precision: f32,
    /// Y axis precision
    pub y_precision: f32,
    /// Time the gesture started
    pub down_time: i64,
    /// Stable per-pointer attributes
    pub pointer_properties: Vec<PointerProperties>,
    /// Append-only sample batch; dispatch entries keep cursors into it
    pub samples: Mutex<Vec<MotionSample>>,
    /// Set once dispatch bookkeeping ran for this entry
    pub dispatch_in_progress: bool,
}

impl MotionEntry {
    /// Build an entry from a producer event
    pub fn from_event(
        seq: u64,
        event: &MotionEvent,
        injection: Option<Arc<InjectionState>>,
    ) -> Self {
        Self {
            seq,
            event_time: event.event_time,
            device_id: event.device_id,
            source: event.source,
            policy_flags: event.policy_flags,
            injection,
            action: event.action,
            flags: event.flags,
            meta_state: event.meta_state,
            edge_flags: event.edge_flags,
            x_precision: event.x_precision,
            y_precision: event.y_precision,
            down_time: event.down_time,
            pointer_properties: event.pointer_properties.clone(),
            samples: Mutex::new(vec![MotionSample {
                event_time: event.event_time,
                event_time_before_coalescing: event.event_time,
                coords: event.pointer_coords.clone(),
            }]),
            dispatch_in_progress: false,
        }
    }

    /// Append one sample to the batch
    pub fn append_sample(&self, event_time: i64, coords: Vec<PointerCoords>) {
        self.samples.lock().push(MotionSample {
            event_time,
            event_time_before_coalescing: event_time,
            coords,
        });
    }

    /// Fold a sample into the newest one, keeping the newest time and
    /// coordinates; `event_time_before_coalescing` stays at the first
    /// folded sample's time so the coalescing window does not slide
    pub fn coalesce_sample(&self, event_time: i64, coords: Vec<PointerCoords>) {
        let mut samples = self.samples.lock();
        if let Some(last) = samples.last_mut() {
            last.event_time = event_time;
            last.coords = coords;
        }
    }

    /// Number of batched samples
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Time of the newest sample, before coalescing adjustments
    pub fn last_sample_time(&self) -> i64 {
        self.samples
            .lock()
            .last()
            .map(|s| s.event_time_before_coalescing)
            .unwrap_or(self.event_time)
    }

    /// Coordinates of the first sample
    pub fn first_coords(&self) -> Vec<PointerCoords> {
        self.samples
            .lock()
            .first()
            .map(|s| s.coords.clone())
            .unwrap_or_default()
    }

    /// Set of pointer ids present in this entry
    pub fn pointer_id_bits(&self) -> PointerIdBits {
        let mut bits = PointerIdBits::EMPTY;
        for props in &self.pointer_properties {
            bits.mark(props.id);
        }
        bits
    }

    /// Split all samples after the first into a new entry with the given
    /// sequence number, leaving this entry with a single sample
    pub fn split_after_first_sample(&mut self, seq: u64) -> Option<MotionEntry> {
        let mut samples = self.samples.lock();
        if samples.len() <= 1 {
            return None;
        }
        let rest: Vec<MotionSample> = samples.drain(1..).collect();
        drop(samples);
        let first_time = rest[0].event_time;
        Some(MotionEntry {
            seq,
            event_time: first_time,
            device_id: self.device_id,
            source: self.source,
            policy_flags: self.policy_flags,
            injection: self.injection.clone(),
            action: self.action,
            flags: self.flags,
            meta_state: self.meta_state,
            edge_flags: self.edge_flags,
            x_precision: self.x_precision,
            y_precision: self.y_precision,
            down_time: self.down_time,
            pointer_properties: self.pointer_properties.clone(),
            samples: Mutex::new(rest),
            dispatch_in_progress: false,
        })
    }
}

/// An entry in the inbound queue
#[derive(Debug)]
pub enum EventEntry {
    /// Display or device configuration changed
    ConfigurationChanged(ConfigurationChangedEntry),
    /// A device was removed or reset
    DeviceReset(DeviceResetEntry),
    /// Key event
    Key(KeyEntry),
    /// Motion event
    Motion(MotionEntry),
}

impl EventEntry {
    /// Queue sequence number
    pub fn seq(&self) -> u64 {
        match self {
            EventEntry::ConfigurationChanged(e) => e.seq,
            EventEntry::DeviceReset(e) => e.seq,
            EventEntry::Key(e) => e.seq,
            EventEntry::Motion(e) => e.seq,
        }
    }

    /// Event time in nanoseconds
    pub fn event_time(&self) -> i64 {
        match self {
            EventEntry::ConfigurationChanged(e) => e.event_time,
            EventEntry::DeviceReset(e) => e.event_time,
            EventEntry::Key(e) => e.event_time,
            EventEntry::Motion(e) => e.event_time,
        }
    }

    /// Injection progress, when this entry was injected
    pub fn injection(&self) -> Option<&Arc<InjectionState>> {
        match self {
            EventEntry::Key(e) => e.injection.as_ref(),
            EventEntry::Motion(e) => e.injection.as_ref(),
            _ => None,
        }
    }

    /// Whether this entry came from an injector rather than a device
    pub fn is_injected(&self) -> bool {
        self.injection().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KeyAction, MotionAction};

    fn key_event() -> KeyEvent {
        KeyEvent {
            event_time: 100,
            device_id: 1,
            source: Source::KEYBOARD,
            policy_flags: PolicyFlags::TRUSTED | PolicyFlags::PASS_TO_USER,
            action: KeyAction::Down,
            flags: KeyFlags::empty(),
            key_code: 62,
            scan_code: 57,
            meta_state: 0,
            repeat_count: 0,
            down_time: 100,
        }
    }

    fn motion_event(action: MotionAction) -> MotionEvent {
        MotionEvent {
            event_time: 100,
            device_id: 2,
            source: Source::TOUCHSCREEN,
            policy_flags: PolicyFlags::TRUSTED | PolicyFlags::PASS_TO_USER,
            action,
            flags: MotionFlags::empty(),
            meta_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 100,
            pointer_properties: vec![PointerProperties { id: 0 }],
            pointer_coords: vec![PointerCoords {
                x: 10.0,
                y: 20.0,
                pressure: 1.0,
                size: 0.1,
            }],
        }
    }

    #[test]
    fn test_key_repeat_sets_long_press_on_first_repeat() {
        let entry = KeyEntry::from_event(1, &key_event(), None);
        let repeat = entry.make_repeat(2, 600);
        assert_eq!(repeat.repeat_count, 1);
        assert!(repeat.flags.contains(KeyFlags::LONG_PRESS));
        let repeat2 = repeat.make_repeat(3, 700);
        assert_eq!(repeat2.repeat_count, 2);
    }

    #[test]
    fn test_motion_sample_append_and_coalesce() {
        let entry = MotionEntry::from_event(1, &motion_event(MotionAction::Move), None);
        entry.append_sample(110, vec![PointerCoords { x: 11.0, ..Default::default() }]);
        assert_eq!(entry.sample_count(), 2);
        entry.coalesce_sample(112, vec![PointerCoords { x: 12.0, ..Default::default() }]);
        assert_eq!(entry.sample_count(), 2);
        // The delivered time and coordinates advance; the coalescing
        // anchor stays at the first folded sample.
        {
            let samples = entry.samples.lock();
            let last = samples.last().unwrap();
            assert_eq!(last.event_time, 112);
            assert_eq!(last.coords[0].x, 12.0);
        }
        assert_eq!(entry.last_sample_time(), 110);
    }

    #[test]
    fn test_split_after_first_sample() {
        let mut entry = MotionEntry::from_event(1, &motion_event(MotionAction::HoverMove), None);
        entry.append_sample(110, vec![PointerCoords::default()]);
        entry.append_sample(120, vec![PointerCoords::default()]);
        let rest = entry.split_after_first_sample(2).unwrap();
        assert_eq!(entry.sample_count(), 1);
        assert_eq!(rest.sample_count(), 2);
        assert_eq!(rest.event_time, 110);
        assert!(entry.split_after_first_sample(3).is_none());
    }

    #[test]
    fn test_injection_pending_counts() {
        let state = InjectionState::new(10, 1000);
        state.add_pending_dispatch();
        state.add_pending_dispatch();
        assert_eq!(state.finish_pending_dispatch(), 1);
        assert_eq!(state.finish_pending_dispatch(), 0);
        state.set_result(InjectionResult::Succeeded);
        state.set_result(InjectionResult::Failed);
        assert_eq!(state.result(), Some(InjectionResult::Succeeded));
    }
}
