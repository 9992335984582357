//! Dispatch state tracking
//!
//! Two stateful pieces sit between target resolution and delivery:
//!
//! - [`input_state::InputState`] remembers, per connection, which keys
//!   and gestures a consumer currently believes are down so that
//!   matching cancel events can be synthesized later.
//! - [`touch_state::TouchState`] remembers, dispatcher-wide, which
//!   windows the current gesture touches and with which pointers.

pub mod input_state;
pub mod touch_state;
