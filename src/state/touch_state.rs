//! Gesture-wide touch state
//!
//! Tracks which windows the current touch gesture has landed in and
//! with which pointers. Target resolution works on a pending copy and
//! commits or discards it depending on the action, so a failed
//! resolution never corrupts the committed gesture.

use crate::dispatcher::targets::TargetFlags;
use crate::event::{PointerIdBits, Source};

/// One window participating in the current gesture
#[derive(Debug, Clone)]
pub struct TouchedWindow {
    /// Channel id of the window's consumer
    pub channel_id: u64,
    /// Dispatch flags for events routed to this window
    pub target_flags: TargetFlags,
    /// Pointers routed to this window when the gesture is split
    pub pointer_ids: PointerIdBits,
}

/// State of the in-progress touch gesture
#[derive(Debug, Clone, Default)]
pub struct TouchState {
    /// Whether a gesture is in progress
    pub down: bool,
    /// Whether the gesture is split across windows
    pub split: bool,
    /// Device that owns the gesture; valid while `down`
    pub device_id: i32,
    /// Source that owns the gesture; valid while `down`
    pub source: Source,
    /// Windows currently receiving the gesture
    pub windows: Vec<TouchedWindow>,
}

impl TouchState {
    /// Empty state
    pub fn new() -> Self {
        Self {
            down: false,
            split: false,
            device_id: -1,
            source: Source::empty(),
            windows: Vec::new(),
        }
    }

    /// Forget the gesture entirely
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Add a window to the gesture, or merge flags and pointers into an
    /// existing entry
    pub fn add_or_update_window(
        &mut self,
        channel_id: u64,
        target_flags: TargetFlags,
        pointer_ids: PointerIdBits,
    ) {
        if target_flags.contains(TargetFlags::SPLIT) {
            self.split = true;
        }
        for touched in &mut self.windows {
            if touched.channel_id == channel_id {
                touched.target_flags |= target_flags;
                if target_flags.contains(TargetFlags::DISPATCH_SLIPPERY_EXIT) {
                    // The exit is this window's last event of the
                    // gesture; it must not keep receiving the stream
                    // as-is.
                    touched.target_flags.remove(TargetFlags::DISPATCH_AS_IS);
                }
                touched.pointer_ids = touched.pointer_ids.union(pointer_ids);
                return;
            }
        }
        self.windows.push(TouchedWindow {
            channel_id,
            target_flags,
            pointer_ids,
        });
    }

    /// Remove a window from the gesture
    pub fn remove_window(&mut self, channel_id: u64) {
        self.windows.retain(|w| w.channel_id != channel_id);
    }

    /// Keep only windows receiving the gesture as-is (or about to via a
    /// slippery enter), normalized to plain as-is dispatch. Transient
    /// outside, hover, and slippery-exit targets do not persist across
    /// samples.
    pub fn filter_non_as_is_touch_windows(&mut self) {
        self.windows.retain_mut(|w| {
            if w.target_flags
                .intersects(TargetFlags::DISPATCH_AS_IS | TargetFlags::DISPATCH_SLIPPERY_ENTER)
            {
                w.target_flags.remove(TargetFlags::DISPATCH_MASK);
                w.target_flags |= TargetFlags::DISPATCH_AS_IS;
                true
            } else {
                false
            }
        });
    }

    /// First foreground window in the gesture
    pub fn first_foreground_window(&self) -> Option<&TouchedWindow> {
        self.windows
            .iter()
            .find(|w| w.target_flags.contains(TargetFlags::FOREGROUND))
    }

    /// A gesture is slippery when exactly one foreground window receives
    /// it and that window opted in; `is_window_slippery` resolves the
    /// window's flag from its channel id
    pub fn is_slippery(&self, is_window_slippery: impl Fn(u64) -> bool) -> bool {
        let mut foreground = self.windows.iter().filter(|w| {
            w.target_flags.contains(TargetFlags::FOREGROUND)
        });
        match (foreground.next(), foreground.next()) {
            (Some(w), None) => is_window_slippery(w.channel_id),
            _ => false,
        }
    }
}
