//! Per-consumer connection state
//!
//! A connection pairs a registered channel with its outbound queue and
//! tracked input state. The head of the outbound queue is the event the
//! consumer is currently processing; everything behind it waits for the
//! finished signal.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::channel::InputChannel;
use crate::dispatcher::targets::TargetFlags;
use crate::event::entry::EventEntry;
use crate::event::{MotionAction, PointerIdBits};
use crate::state::input_state::InputState;

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Healthy, accepting dispatches
    Normal,
    /// Transport failed; terminal, nothing more will be delivered
    Broken,
    /// Unregistered while events were still outstanding
    Zombie,
}

/// One event queued or in flight on a connection
#[derive(Debug)]
pub struct DispatchEntry {
    /// The shared event
    pub event: Arc<EventEntry>,
    /// Target flags resolved for this consumer
    pub target_flags: TargetFlags,
    /// Window-relative X offset
    pub x_offset: f32,
    /// Window-relative Y offset
    pub y_offset: f32,
    /// Per-target motion action; `None` for non-motion entries
    pub resolved_action: Option<MotionAction>,
    /// Pointers routed to this consumer; empty means all pointers
    pub pointer_ids: PointerIdBits,
    /// Whether the consumer is currently processing this entry
    pub in_progress: bool,
    /// Index of the first sample this dispatch covers
    pub head_sample: usize,
    /// Index of the next sample not yet handed to the transport
    pub next_unsent_sample: usize,
    /// Whether further samples may still be appended to the in-flight
    /// event; closed on buffer-full or once batching no longer applies
    pub stream_open: bool,
}

impl DispatchEntry {
    /// New entry covering samples from `head_sample` onward
    pub fn new(
        event: Arc<EventEntry>,
        target_flags: TargetFlags,
        x_offset: f32,
        y_offset: f32,
        resolved_action: Option<MotionAction>,
        pointer_ids: PointerIdBits,
        head_sample: usize,
    ) -> Self {
        Self {
            event,
            target_flags,
            x_offset,
            y_offset,
            resolved_action,
            pointer_ids,
            in_progress: false,
            head_sample,
            next_unsent_sample: head_sample,
            stream_open: true,
        }
    }

    /// Unsent samples remaining beyond what the transport accepted
    pub fn has_unsent_tail(&self) -> bool {
        match self.event.as_ref() {
            EventEntry::Motion(motion) => self.next_unsent_sample < motion.sample_count(),
            _ => false,
        }
    }
}

/// A registered consumer endpoint with its dispatch bookkeeping
pub struct Connection {
    /// Transport to the consumer
    pub channel: Arc<dyn InputChannel>,
    /// Lifecycle status
    pub status: ConnectionStatus,
    /// Monitor connections receive a copy of everything and never gate
    /// dispatch readiness
    pub monitor: bool,
    /// Keys and gestures the consumer currently sees as down
    pub input_state: InputState,
    /// Events queued for or in flight to the consumer
    pub outbound: VecDeque<DispatchEntry>,
    /// Event time of the most recently published event
    pub last_event_time: i64,
    /// Time the most recent dispatch cycle started
    pub last_dispatch_time: i64,
}

impl Connection {
    /// New healthy connection
    pub fn new(channel: Arc<dyn InputChannel>, monitor: bool) -> Self {
        Self {
            channel,
            status: ConnectionStatus::Normal,
            monitor,
            input_state: InputState::new(),
            outbound: VecDeque::new(),
            last_event_time: 0,
            last_dispatch_time: 0,
        }
    }

    /// Channel id
    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    /// Channel name, for logs
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Whether a dispatch is in flight
    pub fn has_dispatch_in_progress(&self) -> bool {
        self.outbound.front().is_some_and(|e| e.in_progress)
    }

    /// Whether the consumer has exceeded its response deadline
    pub fn is_response_overdue(&self, current_time: i64, timeout: i64) -> bool {
        self.has_dispatch_in_progress() && current_time - self.last_dispatch_time > timeout
    }

    /// Whether a new key may be dispatched; keys wait for an empty queue
    /// so ordering with prior events is strict
    pub fn is_ready_for_key(&self) -> bool {
        self.status == ConnectionStatus::Normal && self.outbound.is_empty()
    }

    /// Whether new motion may be dispatched; motion tolerates a backlog
    /// as long as the consumer is still responsive
    pub fn is_ready_for_motion(&self, current_time: i64, timeout: i64) -> bool {
        self.status == ConnectionStatus::Normal
            && !self.is_response_overdue(current_time, timeout)
    }

    /// In-flight dispatch entry for the given shared event, if any
    pub fn find_in_flight(&mut self, event: &Arc<EventEntry>) -> Option<&mut DispatchEntry> {
        self.outbound
            .front_mut()
            .filter(|e| e.in_progress && Arc::ptr_eq(&e.event, event))
    }
}
