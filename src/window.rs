//! Window and application descriptors
//!
//! The window manager publishes a snapshot of the visible window stack
//! through [`crate::Dispatcher::set_input_windows`]. Windows are ordered
//! topmost first; target resolution walks the list front to back.

use bitflags::bitflags;

/// Axis-aligned rectangle in display coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge
    pub left: f32,
    /// Top edge
    pub top: f32,
    /// Right edge
    pub right: f32,
    /// Bottom edge
    pub bottom: f32,
}

impl Rect {
    /// Whether the point lies inside this rectangle, edges inclusive
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    /// Whether two rectangles overlap
    pub fn intersects(&self, other: &Rect) -> bool {
        self.left <= other.right
            && self.right >= other.left
            && self.top <= other.bottom
            && self.bottom >= other.top
    }
}

/// Touchable region as a set of rectangles
#[derive(Debug, Clone, Default)]
pub struct Region {
    /// Component rectangles; empty means an empty region
    pub rects: Vec<Rect>,
}

impl Region {
    /// Region covering a single rectangle
    pub fn rect(rect: Rect) -> Self {
        Self { rects: vec![rect] }
    }

    /// Whether the point lies inside any component rectangle
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.rects.iter().any(|r| r.contains(x, y))
    }
}

bitflags! {
    /// Window behavior flags relevant to input dispatch
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowFlags: u32 {
        /// Window never receives touch events
        const NOT_TOUCHABLE = 0x10;
        /// Window never receives key focus
        const NOT_FOCUSABLE = 0x8;
        /// Touches outside the window go to the windows behind it
        const NOT_TOUCH_MODAL = 0x20;
        /// Window wants a single OUTSIDE event when a touch starts
        /// elsewhere
        const WATCH_OUTSIDE_TOUCH = 0x40000;
        /// Window accepts gestures split across multiple windows
        const SPLIT_TOUCH = 0x80_0000;
        /// Pointers that slide off this window continue in the window
        /// they slide onto
        const SLIPPERY = 0x2000_0000;
        /// Window contents are secure; it never reports obscured state
        const SECURE = 0x2000;
    }
}

/// Window type, in stacking-policy terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Ordinary application window
    BaseApplication,
    /// Application sub-window or dialog
    Application,
    /// Wallpaper behind an application that requested one
    Wallpaper,
    /// Input method (soft keyboard)
    InputMethod,
    /// Trusted system overlay drawn over everything
    SecureSystemOverlay,
    /// System crash or error dialog
    SystemError,
    /// Untrusted overlay from a normal application
    ApplicationOverlay,
}

/// One window in the published window stack
#[derive(Debug, Clone)]
pub struct InputWindow {
    /// Id of the input channel this window consumes from
    pub channel_id: u64,
    /// Human-readable window name, for logs
    pub name: String,
    /// Window frame in display coordinates
    pub frame: Rect,
    /// Region accepting touches; usually equals the frame
    pub touchable_region: Region,
    /// Stacking layer; informational only, order comes from the list
    pub layer: i32,
    /// Whether the window is currently visible
    pub visible: bool,
    /// Paused windows queue events but should not receive new gestures
    pub paused: bool,
    /// Whether this window holds key focus
    pub has_focus: bool,
    /// Whether a wallpaper shows through behind this window
    pub has_wallpaper: bool,
    /// Behavior flags
    pub flags: WindowFlags,
    /// Stacking-policy type
    pub window_type: WindowType,
    /// Per-window dispatching timeout override, nanoseconds
    pub dispatching_timeout: i64,
    /// Owning process id
    pub owner_pid: i32,
    /// Owning user id
    pub owner_uid: i32,
}

impl InputWindow {
    /// Whether the touchable region contains the point
    pub fn touchable_region_contains(&self, x: f32, y: f32) -> bool {
        self.touchable_region.contains(x, y)
    }

    /// Whether the window frame contains the point, edges inclusive
    pub fn frame_contains(&self, x: f32, y: f32) -> bool {
        self.frame.contains(x, y)
    }

    /// Whether the point is a visible touch target for this window
    pub fn is_visible_touch_target(&self, x: f32, y: f32) -> bool {
        self.visible
            && !self.flags.contains(WindowFlags::NOT_TOUCHABLE)
            && self.touchable_region_contains(x, y)
    }

    /// Trusted overlays may cover other windows without marking their
    /// events as obscured
    pub fn is_trusted_overlay(&self) -> bool {
        matches!(
            self.window_type,
            WindowType::InputMethod | WindowType::SecureSystemOverlay
        )
    }

    /// Whether this window accepts gestures split across windows
    pub fn supports_split_touch(&self) -> bool {
        self.flags.contains(WindowFlags::SPLIT_TOUCH)
    }

    /// Touch-modal windows consume touches even outside their touchable
    /// region
    pub fn is_touch_modal(&self) -> bool {
        !self
            .flags
            .intersects(WindowFlags::NOT_FOCUSABLE | WindowFlags::NOT_TOUCH_MODAL)
    }
}

/// The application expected to take input focus next
#[derive(Debug, Clone)]
pub struct InputApplication {
    /// Application name, for logs
    pub name: String,
    /// Dispatching timeout while waiting for its window, nanoseconds
    pub dispatching_timeout: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(frame: Rect) -> InputWindow {
        InputWindow {
            channel_id: 1,
            name: "test".into(),
            frame,
            touchable_region: Region::rect(frame),
            layer: 0,
            visible: true,
            paused: false,
            has_focus: false,
            has_wallpaper: false,
            flags: WindowFlags::empty(),
            window_type: WindowType::BaseApplication,
            dispatching_timeout: crate::config::DEFAULT_DISPATCHING_TIMEOUT,
            owner_pid: 100,
            owner_uid: 1000,
        }
    }

    #[test]
    fn test_frame_contains_is_edge_inclusive() {
        let w = window(Rect { left: 0.0, top: 0.0, right: 100.0, bottom: 50.0 });
        assert!(w.frame_contains(0.0, 0.0));
        assert!(w.frame_contains(100.0, 50.0));
        assert!(!w.frame_contains(100.1, 50.0));
    }

    #[test]
    fn test_touchable_region_multiple_rects() {
        let mut w = window(Rect { left: 0.0, top: 0.0, right: 100.0, bottom: 50.0 });
        w.touchable_region.rects.push(Rect {
            left: 200.0,
            top: 0.0,
            right: 250.0,
            bottom: 50.0,
        });
        assert!(w.touchable_region_contains(220.0, 10.0));
        assert!(!w.touchable_region_contains(150.0, 10.0));
    }

    #[test]
    fn test_not_touchable_window_skipped() {
        let mut w = window(Rect { left: 0.0, top: 0.0, right: 100.0, bottom: 50.0 });
        w.flags = WindowFlags::NOT_TOUCHABLE;
        assert!(!w.is_visible_touch_target(10.0, 10.0));
    }

    #[test]
    fn test_trusted_overlay_types() {
        let mut w = window(Rect::default());
        assert!(!w.is_trusted_overlay());
        w.window_type = WindowType::InputMethod;
        assert!(w.is_trusted_overlay());
        w.window_type = WindowType::SecureSystemOverlay;
        assert!(w.is_trusted_overlay());
    }
}
