//! Input event model
//!
//! Public event types shared between producers (readers, injectors) and
//! the dispatcher core:
//!
//! ```text
//!   Producer                    Dispatcher                Consumer
//!   ┌──────────┐   KeyEvent    ┌──────────┐  entries     ┌─────────┐
//!   │ reader / │──MotionEvent─▶│ inbound  │─────────────▶│ channel │
//!   │ injector │               │ queue    │  (entry.rs)  │         │
//!   └──────────┘               └──────────┘              └─────────┘
//! ```
//!
//! Actions are tagged sum types: the pointer index of a secondary press
//! or release travels in the variant itself rather than in packed bits.

pub mod entry;

use bitflags::bitflags;

/// Maximum number of simultaneous pointers in one motion event
pub const MAX_POINTERS: usize = 16;

/// Largest permitted pointer id value
pub const MAX_POINTER_ID: u32 = 31;

bitflags! {
    /// Device class and identity of an event source
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Source: u32 {
        /// Source produces key events
        const CLASS_BUTTON = 0x0000_0001;
        /// Source produces absolute pointer coordinates
        const CLASS_POINTER = 0x0000_0002;
        /// Source produces relative navigation motions
        const CLASS_NAVIGATION = 0x0000_0004;
        /// Source produces absolute positions without on-screen mapping
        const CLASS_POSITION = 0x0000_0008;

        /// Full keyboard
        const KEYBOARD = 0x0000_0100 | Self::CLASS_BUTTON.bits();
        /// Directional pad
        const DPAD = 0x0000_0200 | Self::CLASS_BUTTON.bits();
        /// Touch screen
        const TOUCHSCREEN = 0x0000_1000 | Self::CLASS_POINTER.bits();
        /// Mouse pointer
        const MOUSE = 0x0000_2000 | Self::CLASS_POINTER.bits();
        /// Trackball
        const TRACKBALL = 0x0001_0000 | Self::CLASS_NAVIGATION.bits();
        /// Touch pad (not mapped to the screen)
        const TOUCHPAD = 0x0010_0000 | Self::CLASS_POSITION.bits();
    }
}

impl Source {
    /// Whether this source reports on-screen pointer coordinates
    pub fn is_pointer(self) -> bool {
        self.contains(Source::CLASS_POINTER)
    }
}

bitflags! {
    /// Flags attached by the reader and the pre-queue policy hook
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PolicyFlags: u32 {
        /// Key came from a virtual (on-screen or capacitive) key
        const VIRTUAL = 0x0000_0100;
        /// Bits reserved for raw reader use
        const RAW_MASK = 0x0000_ffff;

        /// Event was injected rather than read from a device
        const INJECTED = 0x0100_0000;
        /// Event comes from a trusted source (system or permitted injector)
        const TRUSTED = 0x0200_0000;
        /// Event already passed through the input filter
        const FILTERED = 0x0400_0000;
        /// Synthetic key repeats must not be generated for this event
        const DISABLE_KEY_REPEAT = 0x0800_0000;
        /// Event woke the device
        const WOKE_HERE = 0x1000_0000;
        /// Event brightened the screen
        const BRIGHT_HERE = 0x2000_0000;
        /// Event should be delivered to the user
        const PASS_TO_USER = 0x4000_0000;
    }
}

bitflags! {
    /// Per-key-event flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u32 {
        /// Key press was canceled; the matching up must be ignored
        const CANCELED = 0x20;
        /// Key originated from a virtual hard key
        const VIRTUAL_HARD_KEY = 0x40;
        /// First repeat of a held key; long-press behavior may trigger
        const LONG_PRESS = 0x80;
        /// Set with CANCELED when a long press already fired
        const CANCELED_LONG_PRESS = 0x100;
        /// Key is being tracked for a long press
        const TRACKING = 0x200;
        /// Key was synthesized as a fallback for an unhandled key
        const FALLBACK = 0x400;
    }
}

bitflags! {
    /// Per-motion-event flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MotionFlags: u32 {
        /// Another window above the target overlapped the touched point
        const WINDOW_IS_OBSCURED = 0x2;
    }
}

/// Key event action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Key pressed
    Down,
    /// Key released
    Up,
}

/// Motion event action
///
/// Secondary pointer transitions carry their pointer index in the
/// variant payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    /// First pointer went down
    Down,
    /// Last pointer went up
    Up,
    /// Pointers moved while down
    Move,
    /// Gesture aborted; consumers must undo any in-progress handling
    Cancel,
    /// A press began outside the window that is receiving this event
    Outside,
    /// An additional pointer went down; payload is the pointer index
    PointerDown(u8),
    /// A non-final pointer went up; payload is the pointer index
    PointerUp(u8),
    /// Pointer moved while not down (mouse or proximity hover)
    HoverMove,
    /// Scroll wheel or equivalent; never alters touch state
    Scroll,
    /// Pointer entered hover range of the target window
    HoverEnter,
    /// Pointer left hover range of the target window
    HoverExit,
}

impl MotionAction {
    /// Pointer index for secondary transitions
    pub fn pointer_index(self) -> Option<usize> {
        match self {
            MotionAction::PointerDown(i) | MotionAction::PointerUp(i) => Some(i as usize),
            _ => None,
        }
    }

    /// Whether this action starts or extends a touch gesture
    pub fn is_down(self) -> bool {
        matches!(self, MotionAction::Down | MotionAction::PointerDown(_))
    }

    /// Whether this action is a hover transition or move
    pub fn is_hover(self) -> bool {
        matches!(
            self,
            MotionAction::HoverMove | MotionAction::HoverEnter | MotionAction::HoverExit
        )
    }

    /// Whether continuous samples of this action may be batched together
    pub fn can_batch(self) -> bool {
        matches!(self, MotionAction::Move | MotionAction::HoverMove)
    }
}

/// Stable attributes of one pointer within a gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerProperties {
    /// Pointer id, stable for the lifetime of the gesture
    pub id: u32,
}

/// Position and contact data for one pointer at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerCoords {
    /// X position in display coordinates
    pub x: f32,
    /// Y position in display coordinates
    pub y: f32,
    /// Contact pressure, 0.0 to 1.0
    pub pressure: f32,
    /// Contact size, 0.0 to 1.0
    pub size: f32,
}

impl PointerCoords {
    /// Coords translated by the given offset
    pub fn offset(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

/// Compact set of pointer ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerIdBits(pub u32);

impl PointerIdBits {
    /// Empty set
    pub const EMPTY: PointerIdBits = PointerIdBits(0);

    /// Whether no ids are marked
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of marked ids
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the given id is marked
    pub fn has(self, id: u32) -> bool {
        debug_assert!(id <= MAX_POINTER_ID);
        self.0 & (1 << id) != 0
    }

    /// Mark an id
    pub fn mark(&mut self, id: u32) {
        debug_assert!(id <= MAX_POINTER_ID);
        self.0 |= 1 << id;
    }

    /// Clear an id
    pub fn clear(&mut self, id: u32) {
        debug_assert!(id <= MAX_POINTER_ID);
        self.0 &= !(1 << id);
    }

    /// Lowest marked id, if any
    pub fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Intersection with another set
    pub fn intersect(self, other: PointerIdBits) -> PointerIdBits {
        PointerIdBits(self.0 & other.0)
    }

    /// Union with another set
    pub fn union(self, other: PointerIdBits) -> PointerIdBits {
        PointerIdBits(self.0 | other.0)
    }

    /// Iterate marked ids in ascending order
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..=MAX_POINTER_ID).filter(move |id| self.0 & (1 << id) != 0)
    }
}

/// Either kind of dispatchable event, as used by injection and the
/// input filter
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// A key event
    Key(KeyEvent),
    /// A motion event
    Motion(MotionEvent),
}

/// Key event as supplied by a producer
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Time the key state changed, nanoseconds
    pub event_time: i64,
    /// Originating device
    pub device_id: i32,
    /// Source class of the device
    pub source: Source,
    /// Reader / policy flags
    pub policy_flags: PolicyFlags,
    /// Press or release
    pub action: KeyAction,
    /// Key flags
    pub flags: KeyFlags,
    /// Logical key code
    pub key_code: i32,
    /// Hardware scan code
    pub scan_code: i32,
    /// Modifier key state
    pub meta_state: u32,
    /// Number of repeats so far (0 for an initial press)
    pub repeat_count: u32,
    /// Time of the initial press in the current sequence
    pub down_time: i64,
}

/// Motion event as supplied by a producer
#[derive(Debug, Clone)]
pub struct MotionEvent {
    /// Time of the sample, nanoseconds
    pub event_time: i64,
    /// Originating device
    pub device_id: i32,
    /// Source class of the device
    pub source: Source,
    /// Reader / policy flags
    pub policy_flags: PolicyFlags,
    /// Motion action
    pub action: MotionAction,
    /// Motion flags
    pub flags: MotionFlags,
    /// Modifier key state
    pub meta_state: u32,
    /// Display edges the gesture started on
    pub edge_flags: u32,
    /// X axis precision
    pub x_precision: f32,
    /// Y axis precision
    pub y_precision: f32,
    /// Time the gesture started
    pub down_time: i64,
    /// Per-pointer stable attributes, parallel to `pointer_coords`
    pub pointer_properties: Vec<PointerProperties>,
    /// Per-pointer positions for this sample
    pub pointer_coords: Vec<PointerCoords>,
}

impl MotionEvent {
    /// Structural validation of pointer counts, ids, and indices
    pub fn validate(&self) -> std::result::Result<(), String> {
        let count = self.pointer_properties.len();
        if count == 0 || count > MAX_POINTERS {
            return Err(format!("pointer count {count} out of range"));
        }
        if self.pointer_coords.len() != count {
            return Err("pointer coords and properties length mismatch".into());
        }
        let mut seen = PointerIdBits::EMPTY;
        for props in &self.pointer_properties {
            if props.id > MAX_POINTER_ID {
                return Err(format!("pointer id {} out of range", props.id));
            }
            if seen.has(props.id) {
                return Err(format!("duplicate pointer id {}", props.id));
            }
            seen.mark(props.id);
        }
        if let Some(index) = self.action.pointer_index() {
            if index >= count {
                return Err(format!("action pointer index {index} out of range"));
            }
        }
        Ok(())
    }

    /// Set of pointer ids present in this event
    pub fn pointer_id_bits(&self) -> PointerIdBits {
        let mut bits = PointerIdBits::EMPTY;
        for props in &self.pointer_properties {
            bits.mark(props.id);
        }
        bits
    }
}
