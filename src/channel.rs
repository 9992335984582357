//! Transport seam between the dispatcher and event consumers
//!
//! The dispatcher never talks to a socket or shared-memory region
//! directly; it publishes through [`InputChannel`]. A production
//! implementation wraps whatever IPC the platform provides, tests plug
//! in an in-memory fake.

use thiserror::Error;

use crate::event::{
    KeyAction, KeyFlags, MotionAction, MotionFlags, PointerCoords, PointerProperties, Source,
};

/// Transport-level publish failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The shared buffer still holds an unconsumed event; appending more
    /// samples is no longer possible
    #[error("Channel buffer is full")]
    BufferFull,

    /// The consumer already consumed the in-flight event, so its sample
    /// batch can no longer be extended
    #[error("In-flight event was already consumed")]
    AlreadyConsumed,

    /// The connection broke and will never deliver again
    #[error("Channel is broken")]
    Broken,
}

/// Key event as published to a consumer
#[derive(Debug, Clone)]
pub struct PublishedKey {
    /// Device the event came from
    pub device_id: i32,
    /// Source class
    pub source: Source,
    /// Press or release
    pub action: KeyAction,
    /// Key flags, including synthesized CANCELED / FALLBACK
    pub flags: KeyFlags,
    /// Logical key code
    pub key_code: i32,
    /// Hardware scan code
    pub scan_code: i32,
    /// Modifier state
    pub meta_state: u32,
    /// Repeat count
    pub repeat_count: u32,
    /// Time of the initial press
    pub down_time: i64,
    /// Time of this event
    pub event_time: i64,
}

/// Motion event as published to a consumer, holding its first sample
#[derive(Debug, Clone)]
pub struct PublishedMotion {
    /// Device the event came from
    pub device_id: i32,
    /// Source class
    pub source: Source,
    /// Action after per-target resolution
    pub action: MotionAction,
    /// Motion flags, including WINDOW_IS_OBSCURED
    pub flags: MotionFlags,
    /// Display edges the gesture started on
    pub edge_flags: u32,
    /// Modifier state
    pub meta_state: u32,
    /// Window-relative X offset applied to all samples
    pub x_offset: f32,
    /// Window-relative Y offset applied to all samples
    pub y_offset: f32,
    /// X axis precision
    pub x_precision: f32,
    /// Y axis precision
    pub y_precision: f32,
    /// Gesture start time
    pub down_time: i64,
    /// Time of the first published sample
    pub event_time: i64,
    /// Per-pointer attributes
    pub pointer_properties: Vec<PointerProperties>,
    /// First sample coordinates, window-relative
    pub pointer_coords: Vec<PointerCoords>,
}

/// One consumer endpoint
///
/// `publish_*` hand an event to the consumer; `append_motion_sample`
/// extends the in-flight motion event's batch. After publishing, the
/// dispatcher calls `send_dispatch_signal` once; the consumer answers
/// with a finished signal that the dispatcher collects through
/// `receive_finished_signal`.
pub trait InputChannel: Send + Sync {
    /// Stable channel id, unique per registration
    fn id(&self) -> u64;

    /// Channel name, for logs
    fn name(&self) -> &str;

    /// Publish a key event
    fn publish_key(&self, key: &PublishedKey) -> Result<(), TransportError>;

    /// Publish a motion event with its first sample
    fn publish_motion(&self, motion: &PublishedMotion) -> Result<(), TransportError>;

    /// Append one sample to the in-flight motion event
    fn append_motion_sample(
        &self,
        event_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), TransportError>;

    /// Tell the consumer an event is ready
    fn send_dispatch_signal(&self) -> Result<(), TransportError>;

    /// Collect the consumer's finished signal; returns whether the
    /// consumer reported handling the event
    fn receive_finished_signal(&self) -> Result<bool, TransportError>;
}
