//! # input-dispatch
//!
//! Input event dispatch engine: routes key and motion events from input
//! devices (and injecting processes) to window consumers over
//! per-consumer channels.
//!
//! # Architecture
//!
//! ```text
//! producers (notify_* / inject_event)
//!   └─> inbound queue          batching, coalescing, app-switch expedite
//!         └─> Dispatcher       target resolution, drop policy, key repeat
//!               ├─> Connection per-consumer outbound queue
//!               │     └─> InputChannel (transport seam)
//!               ├─> DispatchPolicy    out-of-lock system callbacks
//!               └─> InputState        synthesized cancels on reset
//! ```
//!
//! The engine itself is transport-agnostic: consumers are reached
//! through the [`channel::InputChannel`] trait, and all system
//! interaction (key interception, fallback keys, not-responding
//! verdicts) goes through [`policy::DispatchPolicy`].
//!
//! # Threading
//!
//! [`dispatcher::Dispatcher`] is fully synchronized; producers,
//! consumers, and the window manager call it from their own threads.
//! [`dispatcher::DispatcherThread`] runs the blocking dispatch loop.
//! Tests drive [`dispatcher::Dispatcher::dispatch_once`] directly with a
//! fake clock instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transport seam between the dispatcher and consumers
pub mod channel;

/// Tuning parameters and the clock seam
pub mod config;

/// Per-consumer connection bookkeeping
pub mod connection;

/// The dispatch engine
pub mod dispatcher;

/// Error types
pub mod error;

/// Events, entries, and injection state
pub mod event;

/// System policy callback seam
pub mod policy;

/// Tracked consumer input state and touch state
pub mod state;

/// Windows, applications, and hit testing
pub mod window;

pub use channel::{InputChannel, PublishedKey, PublishedMotion, TransportError};
pub use config::{Clock, DispatcherConfig, MonotonicClock};
pub use dispatcher::targets::{InputTarget, TargetFlags};
pub use dispatcher::{Dispatcher, DispatcherThread, InjectionSyncMode};
pub use error::{DispatchError, Result};
pub use event::entry::InjectionResult;
pub use event::{
    InputEvent, KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent, MotionFlags,
    PointerCoords, PointerProperties, PolicyFlags, Source,
};
pub use policy::{DispatchPolicy, InterceptResult};
pub use window::{InputApplication, InputWindow, Rect, WindowFlags, WindowType};
