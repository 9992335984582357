//! Policy collaborator
//!
//! The embedding system supplies a [`DispatchPolicy`]; the dispatcher
//! consults it for interception, filtering, and notification. Every
//! policy method is invoked with the dispatcher lock released, via the
//! deferred command queue, so implementations may call back into the
//! dispatcher freely.

use crate::config::DispatcherConfig;
use crate::event::{InputEvent, KeyEvent, PolicyFlags};

/// User-activity event type for [`DispatchPolicy::poke_user_activity`]
pub const USER_ACTIVITY_EVENT_BUTTON: u32 = 1;
/// User-activity event type for touch and pointer motion
pub const USER_ACTIVITY_EVENT_TOUCH: u32 = 2;

/// Verdict of the pre-dispatch key intercept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptResult {
    /// Deliver the key to the focused window as usual
    Continue,
    /// The policy consumed the key; drop it without dispatching
    Skip,
}

/// System-side collaborator consulted during dispatch
///
/// Implementations must not block for long periods; the dispatcher's
/// loop stalls while a policy call is outstanding.
pub trait DispatchPolicy: Send + Sync {
    /// Inspect a key before it enters the queue. The policy may adjust
    /// the flags (wake the device, pass to user) in place.
    fn intercept_key_before_queueing(&self, event: &KeyEvent, policy_flags: &mut PolicyFlags);

    /// Inspect a non-key event before it enters the queue.
    fn intercept_generic_before_queueing(&self, event_time: i64, policy_flags: &mut PolicyFlags);

    /// Decide whether the focused window should see this key.
    fn intercept_key_before_dispatching(&self, channel_id: Option<u64>, event: &KeyEvent)
        -> InterceptResult;

    /// Offer an event to the input filter. Returning `false` swallows
    /// the event; the filter is expected to re-inject what it keeps.
    fn filter_input_event(&self, event: &InputEvent, policy_flags: PolicyFlags) -> bool;

    /// A configuration-change marker reached the head of the queue.
    fn notify_configuration_changed(&self, event_time: i64);

    /// A target is not responding. Returns a new timeout in nanoseconds;
    /// zero or negative means give up and abort the target.
    fn notify_anr(&self, application: Option<&str>, channel_id: Option<u64>) -> i64;

    /// A consumer's channel broke and was abandoned.
    fn notify_input_channel_broken(&self, channel_id: u64);

    /// The focused window did not handle a key. The policy may supply a
    /// fallback key to dispatch in its place.
    fn dispatch_unhandled_key(&self, channel_id: Option<u64>, event: &KeyEvent)
        -> Option<KeyEvent>;

    /// A user-initiated event was dispatched; reset idle timers.
    fn poke_user_activity(&self, event_time: i64, event_type: u32);

    /// An app-switch key was released.
    fn notify_switch(&self, event_time: i64, switch_code: i32, switch_value: i32);

    /// Whether the injector may act on behalf of the given window owner.
    fn check_injection_permission(
        &self,
        owner_uid: Option<i32>,
        injector_pid: i32,
        injector_uid: i32,
    ) -> bool;

    /// Whether held keys repeat.
    fn is_key_repeat_enabled(&self) -> bool {
        true
    }

    /// Dispatcher tuning parameters.
    fn get_dispatcher_configuration(&self) -> DispatcherConfig {
        DispatcherConfig::default()
    }
}
