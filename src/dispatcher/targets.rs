//! Target resolution
//!
//! Decides which windows an event goes to. Keys and non-pointer motion
//! follow focus; pointer motion follows the touch state machine with
//! its split, hover, slippery, outside, and wallpaper rules. When a
//! target exists but is not ready, resolution parks the event and arms
//! the not-responding timeout.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use super::commands::Command;
use super::{DispatchState, TargetWaitCause};
use crate::event::entry::{InjectionState, MotionEntry};
use crate::event::{MotionAction, PointerIdBits};
use crate::window::{InputWindow, WindowType};

bitflags! {
    /// Per-target dispatch flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetFlags: u32 {
        /// Target is in the foreground of the gesture; its readiness
        /// and responsiveness gate dispatch
        const FOREGROUND = 1 << 0;
        /// Gesture is split; only the pointers in the target's id set
        /// are delivered
        const SPLIT = 1 << 1;
        /// Another window of a different owner covers the touched point
        const WINDOW_IS_OBSCURED = 1 << 2;
        /// Coordinates are withheld from this target
        const ZERO_COORDS = 1 << 3;

        /// Deliver the event unchanged
        const DISPATCH_AS_IS = 1 << 8;
        /// Deliver as an outside notification
        const DISPATCH_OUTSIDE = 1 << 9;
        /// Deliver as a hover enter
        const DISPATCH_HOVER_ENTER = 1 << 10;
        /// Deliver as a hover exit
        const DISPATCH_HOVER_EXIT = 1 << 11;
        /// Deliver as a cancel; the gesture slid off this window
        const DISPATCH_SLIPPERY_EXIT = 1 << 12;
        /// Deliver as a down; the gesture slid onto this window
        const DISPATCH_SLIPPERY_ENTER = 1 << 13;

        /// All dispatch-mode bits
        const DISPATCH_MASK = Self::DISPATCH_AS_IS.bits()
            | Self::DISPATCH_OUTSIDE.bits()
            | Self::DISPATCH_HOVER_ENTER.bits()
            | Self::DISPATCH_HOVER_EXIT.bits()
            | Self::DISPATCH_SLIPPERY_EXIT.bits()
            | Self::DISPATCH_SLIPPERY_ENTER.bits();
    }
}

/// One resolved dispatch target
#[derive(Debug, Clone)]
pub struct InputTarget {
    /// Consumer to deliver to
    pub channel_id: u64,
    /// Dispatch flags
    pub flags: TargetFlags,
    /// Offset translating display to window coordinates
    pub x_offset: f32,
    /// Offset translating display to window coordinates
    pub y_offset: f32,
    /// Pointers for this target when the gesture is split; empty means
    /// all pointers
    pub pointer_ids: PointerIdBits,
}

/// Outcome of target resolution
#[derive(Debug)]
pub(crate) enum TargetResolution {
    /// Targets found; dispatch may proceed
    Succeeded(Vec<InputTarget>),
    /// No viable target; drop the event
    Failed,
    /// An injected event may not touch the target window
    PermissionDenied,
    /// The wait for a ready target expired; drop the event
    TimedOut,
    /// Target exists but is not ready; retry after the wakeup time
    Pending,
}

fn target_for_window(window: &InputWindow, flags: TargetFlags, pointer_ids: PointerIdBits) -> InputTarget {
    InputTarget {
        channel_id: window.channel_id,
        flags,
        x_offset: -window.frame.left,
        y_offset: -window.frame.top,
        pointer_ids,
    }
}

/// Topmost visible touchable window at the point, honoring touch-modal
fn find_touchable_window_at(windows: &[InputWindow], x: f32, y: f32) -> Option<usize> {
    windows.iter().position(|w| {
        w.visible
            && !w.flags.contains(crate::window::WindowFlags::NOT_TOUCHABLE)
            && (w.is_touch_modal() || w.touchable_region_contains(x, y))
    })
}

/// Whether a window of another owner above `index` covers the point
fn is_obscured_at(windows: &[InputWindow], index: usize, x: f32, y: f32) -> bool {
    let owner = windows[index].owner_uid;
    windows[..index].iter().any(|w| {
        w.visible && !w.is_trusted_overlay() && w.owner_uid != owner && w.frame_contains(x, y)
    })
}

fn injection_denied(
    injection: Option<&Arc<InjectionState>>,
    trusted: bool,
    owner_uid: i32,
) -> bool {
    match injection {
        Some(state) if !trusted => owner_uid != state.injector_uid,
        _ => false,
    }
}

impl DispatchState {
    /// Park the pending event until its target becomes ready, arming the
    /// not-responding timeout. With no application or channel this is an
    /// indefinite wait on the system (for example a pending crash
    /// dialog).
    pub(crate) fn handle_targets_not_ready(
        &mut self,
        current_time: i64,
        application: Option<String>,
        channel_id: Option<u64>,
        timeout: i64,
        next_wake: &mut i64,
        reason: &str,
    ) -> TargetResolution {
        if application.is_none() && channel_id.is_none() {
            if self.target_wait.cause != TargetWaitCause::SystemNotResponsive {
                debug!(reason, "Waiting indefinitely for the system to be ready");
                self.target_wait.cause = TargetWaitCause::SystemNotResponsive;
                self.target_wait.start_time = current_time;
                self.target_wait.deadline = i64::MAX;
                self.target_wait.anr_posted = false;
                self.target_wait.application = None;
                self.target_wait.channel_id = None;
            }
        } else {
            let same_target = self.target_wait.cause == TargetWaitCause::ApplicationNotReady
                && self.target_wait.channel_id == channel_id
                && self.target_wait.application == application;
            if !same_target {
                debug!(?application, ?channel_id, timeout, reason, "Waiting for application to be ready");
                self.target_wait.cause = TargetWaitCause::ApplicationNotReady;
                self.target_wait.start_time = current_time;
                self.target_wait.deadline = current_time.saturating_add(timeout);
                self.target_wait.anr_posted = false;
                self.target_wait.application = application;
                self.target_wait.channel_id = channel_id;
            }
        }

        if self.target_wait.deadline != i64::MAX
            && current_time >= self.target_wait.deadline
            && !self.target_wait.anr_posted
        {
            warn!(
                application = ?self.target_wait.application,
                channel_id = ?self.target_wait.channel_id,
                waited_ns = current_time - self.target_wait.start_time,
                "Target is not responding"
            );
            self.target_wait.anr_posted = true;
            // Hold the wait open until the policy answers.
            self.target_wait.deadline = i64::MAX;
            self.commands.push_back(Command::NotifyAnr {
                application: self.target_wait.application.clone(),
                channel_id: self.target_wait.channel_id,
            });
        }

        if self.target_wait.deadline < *next_wake {
            *next_wake = self.target_wait.deadline;
        }
        TargetResolution::Pending
    }

    /// Resolve the focused window as the single foreground target.
    pub(crate) fn find_focused_window_targets(
        &mut self,
        current_time: i64,
        injection: Option<&Arc<InjectionState>>,
        trusted: bool,
        for_key: bool,
        next_wake: &mut i64,
    ) -> TargetResolution {
        if self.target_wait.expired {
            return TargetResolution::TimedOut;
        }

        let Some(window) = self.windows.iter().find(|w| w.has_focus).cloned() else {
            if let Some(app) = self.focused_application.clone() {
                return self.handle_targets_not_ready(
                    current_time,
                    Some(app.name),
                    None,
                    app.dispatching_timeout,
                    next_wake,
                    "focused application has no focused window yet",
                );
            }
            debug!("Dropping event, no focused window and no focused application");
            return TargetResolution::Failed;
        };

        if injection_denied(injection, trusted, window.owner_uid) {
            warn!(window = %window.name, "Injection into focused window denied");
            return TargetResolution::PermissionDenied;
        }

        if window.paused {
            return self.handle_targets_not_ready(
                current_time,
                None,
                Some(window.channel_id),
                window.dispatching_timeout,
                next_wake,
                "focused window is paused",
            );
        }

        let ready = match self.connections.get(&window.channel_id) {
            Some(conn) if conn.status == crate::connection::ConnectionStatus::Normal => {
                if for_key {
                    conn.is_ready_for_key()
                } else {
                    conn.is_ready_for_motion(current_time, window.dispatching_timeout)
                }
            }
            _ => {
                warn!(window = %window.name, "Dropping event, focused window has no registered channel");
                return TargetResolution::Failed;
            }
        };
        if !ready {
            return self.handle_targets_not_ready(
                current_time,
                None,
                Some(window.channel_id),
                window.dispatching_timeout,
                next_wake,
                "focused window is not ready for more input",
            );
        }

        TargetResolution::Succeeded(vec![target_for_window(
            &window,
            TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
            PointerIdBits::EMPTY,
        )])
    }

    /// Resolve the windows touched by a pointer motion event, updating
    /// the committed touch state on success.
    pub(crate) fn find_touched_window_targets(
        &mut self,
        current_time: i64,
        entry: &MotionEntry,
        next_wake: &mut i64,
        conflicting_pointer_actions: &mut bool,
    ) -> TargetResolution {
        if self.target_wait.expired {
            return TargetResolution::TimedOut;
        }

        let windows = self.windows.clone();
        let action = entry.action;
        let trusted = entry
            .policy_flags
            .contains(crate::event::PolicyFlags::TRUSTED);
        let injection = entry.injection.as_ref();
        let first_coords = entry.first_coords();
        let acting_index = action.pointer_index().unwrap_or(0);
        let (x, y) = first_coords
            .get(acting_index)
            .map(|c| (c.x, c.y))
            .unwrap_or((0.0, 0.0));

        let new_gesture = matches!(
            action,
            MotionAction::Down
                | MotionAction::Scroll
                | MotionAction::HoverEnter
                | MotionAction::HoverMove
                | MotionAction::HoverExit
        );

        let mut temp = self.touch.clone();

        if new_gesture {
            if action == MotionAction::Down && temp.down && temp.device_id == entry.device_id {
                // Two downs in a row from the same device.
                *conflicting_pointer_actions = true;
            }
            temp.reset();
            temp.down = action == MotionAction::Down;
            temp.device_id = entry.device_id;
            temp.source = entry.source;

            if action == MotionAction::HoverExit {
                let Some(old) = self.last_hover_channel.take() else {
                    debug!("Dropping hover exit, nothing is hovered");
                    return TargetResolution::Failed;
                };
                if let Some(window) = windows.iter().find(|w| w.channel_id == old) {
                    temp.add_or_update_window(
                        window.channel_id,
                        TargetFlags::FOREGROUND | TargetFlags::DISPATCH_AS_IS,
                        PointerIdBits::EMPTY,
                    );
                } else {
                    return TargetResolution::Failed;
                }
            } else {
                // A pending crash dialog takes precedence over everything.
                let error_window = windows
                    .iter()
                    .find(|w| w.window_type == WindowType::SystemError);

                let mut touched_index = None;
                for (i, window) in windows.iter().enumerate() {
                    if !window.visible {
                        continue;
                    }
                    if !window
                        .flags
                        .contains(crate::window::WindowFlags::NOT_TOUCHABLE)
                        && (window.is_touch_modal() || window.touchable_region_contains(x, y))
                    {
                        touched_index = Some(i);
                        break;
                    }
                    if action == MotionAction::Down
                        && window
                            .flags
                            .contains(crate::window::WindowFlags::WATCH_OUTSIDE_TOUCH)
                    {
                        temp.add_or_update_window(
                            window.channel_id,
                            TargetFlags::DISPATCH_OUTSIDE,
                            PointerIdBits::EMPTY,
                        );
                    }
                }

                if let Some(error_window) = error_window {
                    let touched_is_error = touched_index
                        .is_some_and(|i| windows[i].channel_id == error_window.channel_id);
                    if !touched_is_error {
                        return self.handle_targets_not_ready(
                            current_time,
                            None,
                            None,
                            0,
                            next_wake,
                            "waiting for the system error window to take focus",
                        );
                    }
                }

                let Some(touched_index) = touched_index else {
                    debug!(x, y, "Dropping event, no touchable window at point");
                    return TargetResolution::Failed;
                };
                let touched = &windows[touched_index];

                let mut target_flags = TargetFlags::FOREGROUND;
                let is_hover = action.is_hover();
                if is_hover {
                    if self.last_hover_channel != Some(touched.channel_id) {
                        if let Some(old) = self.last_hover_channel {
                            temp.add_or_update_window(
                                old,
                                TargetFlags::DISPATCH_HOVER_EXIT,
                                PointerIdBits::EMPTY,
                            );
                        }
                        target_flags |= TargetFlags::DISPATCH_HOVER_ENTER;
                    } else {
                        target_flags |= TargetFlags::DISPATCH_AS_IS;
                    }
                    self.last_hover_channel = Some(touched.channel_id);
                } else {
                    target_flags |= TargetFlags::DISPATCH_AS_IS;
                }

                let mut pointer_ids = PointerIdBits::EMPTY;
                if touched.supports_split_touch() && action == MotionAction::Down {
                    target_flags |= TargetFlags::SPLIT;
                    if let Some(props) = entry.pointer_properties.get(acting_index) {
                        pointer_ids.mark(props.id);
                    }
                }
                if is_obscured_at(&windows, touched_index, x, y) {
                    target_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                }
                temp.add_or_update_window(touched.channel_id, target_flags, pointer_ids);

                // Wallpaper windows mirror the gesture behind the
                // foreground window.
                if action == MotionAction::Down && touched.has_wallpaper {
                    for window in windows.iter().skip(touched_index + 1) {
                        if window.visible && window.window_type == WindowType::Wallpaper {
                            temp.add_or_update_window(
                                window.channel_id,
                                TargetFlags::DISPATCH_AS_IS,
                                PointerIdBits::EMPTY,
                            );
                        }
                    }
                }
            }
        } else {
            if !temp.down {
                debug!("Dropping event, no gesture in progress");
                return TargetResolution::Failed;
            }
            if entry.device_id != temp.device_id || entry.source != temp.source {
                // Another device moved mid-gesture; ignore it without
                // perturbing the gesture that owns the touch state.
                debug!(
                    device_id = entry.device_id,
                    "Dropping event from a device that does not own the gesture"
                );
                return TargetResolution::Failed;
            }

            if let MotionAction::PointerDown(index) = action {
                if temp.split {
                    let (px, py) = first_coords
                        .get(index as usize)
                        .map(|c| (c.x, c.y))
                        .unwrap_or((0.0, 0.0));
                    if let Some(i) = find_touchable_window_at(&windows, px, py) {
                        let window = &windows[i];
                        let mut target_flags = TargetFlags::FOREGROUND
                            | TargetFlags::DISPATCH_AS_IS
                            | TargetFlags::SPLIT;
                        if is_obscured_at(&windows, i, px, py) {
                            target_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                        }
                        let mut pointer_ids = PointerIdBits::EMPTY;
                        if let Some(props) = entry.pointer_properties.get(index as usize) {
                            pointer_ids.mark(props.id);
                        }
                        temp.add_or_update_window(window.channel_id, target_flags, pointer_ids);
                    }
                }
            }

            // Only a single-pointer move can slide a gesture off a
            // slippery window.
            if action == MotionAction::Move && entry.pointer_properties.len() == 1 {
                let slippery = temp.is_slippery(|id| {
                    windows
                        .iter()
                        .find(|w| w.channel_id == id)
                        .is_some_and(|w| w.flags.contains(crate::window::WindowFlags::SLIPPERY))
                });
                if slippery {
                    let old_channel = temp
                        .first_foreground_window()
                        .map(|w| (w.channel_id, w.pointer_ids));
                    if let Some((old_channel, old_pointers)) = old_channel {
                        if let Some(i) = find_touchable_window_at(&windows, x, y) {
                            let window = &windows[i];
                            if window.channel_id != old_channel {
                                debug!(
                                    from = old_channel,
                                    to = window.channel_id,
                                    "Gesture slipped onto another window"
                                );
                                temp.add_or_update_window(
                                    old_channel,
                                    TargetFlags::DISPATCH_SLIPPERY_EXIT,
                                    old_pointers,
                                );
                                let mut target_flags = TargetFlags::FOREGROUND
                                    | TargetFlags::DISPATCH_SLIPPERY_ENTER;
                                let mut pointer_ids = PointerIdBits::EMPTY;
                                if window.supports_split_touch() {
                                    target_flags |= TargetFlags::SPLIT;
                                    if let Some(props) = entry.pointer_properties.first() {
                                        pointer_ids.mark(props.id);
                                    }
                                }
                                if is_obscured_at(&windows, i, x, y) {
                                    target_flags |= TargetFlags::WINDOW_IS_OBSCURED;
                                }
                                temp.add_or_update_window(
                                    window.channel_id,
                                    target_flags,
                                    pointer_ids,
                                );
                            }
                        }
                    }
                }
            }
        }

        // Injected gestures may only land in the injector's own windows.
        for touched in &temp.windows {
            if let Some(window) = windows.iter().find(|w| w.channel_id == touched.channel_id) {
                if injection_denied(injection, trusted, window.owner_uid) {
                    warn!(window = %window.name, "Injection into touched window denied");
                    return TargetResolution::PermissionDenied;
                }
            }
        }

        // Every foreground window must be ready before anything is
        // dispatched, so gestures stay ordered across windows.
        for touched in &temp.windows {
            if !touched.target_flags.contains(TargetFlags::FOREGROUND) {
                continue;
            }
            let Some(window) = windows.iter().find(|w| w.channel_id == touched.channel_id)
            else {
                continue;
            };
            if window.paused {
                return self.handle_targets_not_ready(
                    current_time,
                    None,
                    Some(window.channel_id),
                    window.dispatching_timeout,
                    next_wake,
                    "touched window is paused",
                );
            }
            match self.connections.get(&touched.channel_id) {
                Some(conn) if conn.status == crate::connection::ConnectionStatus::Normal => {
                    if !conn.is_ready_for_motion(current_time, window.dispatching_timeout) {
                        return self.handle_targets_not_ready(
                            current_time,
                            None,
                            Some(window.channel_id),
                            window.dispatching_timeout,
                            next_wake,
                            "touched window is not ready for more input",
                        );
                    }
                }
                _ => {
                    debug!(window = %window.name, "Touched window has no registered channel");
                    return TargetResolution::Failed;
                }
            }
        }

        // Build targets. Outside targets of other owners get their
        // coordinates withheld.
        let foreground_uid = temp
            .first_foreground_window()
            .and_then(|t| windows.iter().find(|w| w.channel_id == t.channel_id))
            .map(|w| w.owner_uid);
        let mut targets = Vec::with_capacity(temp.windows.len());
        for touched in &temp.windows {
            let Some(window) = windows.iter().find(|w| w.channel_id == touched.channel_id)
            else {
                continue;
            };
            let mut flags = touched.target_flags;
            if flags.contains(TargetFlags::DISPATCH_OUTSIDE)
                && foreground_uid.is_some_and(|uid| uid != window.owner_uid)
            {
                flags |= TargetFlags::ZERO_COORDS;
            }
            targets.push(target_for_window(window, flags, touched.pointer_ids));
        }
        if targets.is_empty() {
            return TargetResolution::Failed;
        }

        // Commit the touch state.
        if let MotionAction::PointerUp(index) = action {
            if temp.split {
                if let Some(props) = entry.pointer_properties.get(index as usize) {
                    let id = props.id;
                    for touched in &mut temp.windows {
                        touched.pointer_ids.clear(id);
                    }
                    temp.windows.retain(|w| {
                        !w.target_flags.contains(TargetFlags::SPLIT) || !w.pointer_ids.is_empty()
                    });
                }
            }
        }
        match action {
            MotionAction::Up | MotionAction::Cancel => self.touch.reset(),
            MotionAction::Scroll
            | MotionAction::HoverEnter
            | MotionAction::HoverMove
            | MotionAction::HoverExit => {}
            _ => {
                temp.filter_non_as_is_touch_windows();
                self.touch = temp;
            }
        }

        TargetResolution::Succeeded(targets)
    }

    /// Append a plain copy target for every monitor channel
    pub(crate) fn add_monitor_targets(&self, targets: &mut Vec<InputTarget>) {
        for &id in &self.monitors {
            targets.push(InputTarget {
                channel_id: id,
                flags: TargetFlags::DISPATCH_AS_IS,
                x_offset: 0.0,
                y_offset: 0.0,
                pointer_ids: PointerIdBits::EMPTY,
            });
        }
    }
}
