//! End-to-end dispatch scenarios driven through the public API with an
//! in-memory channel, a scripted policy, and a fake clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use input_dispatch::config::{Clock, MILLIS, SECONDS};
use input_dispatch::window::Region;
use input_dispatch::{
    DispatchPolicy, Dispatcher, DispatcherConfig, DispatcherThread, InjectionResult,
    InjectionSyncMode, InputApplication, InputChannel, InputEvent, InputWindow, InterceptResult,
    KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent, MotionFlags, PointerCoords,
    PointerProperties, PolicyFlags, PublishedKey, PublishedMotion, Rect, Source, TransportError,
    WindowFlags, WindowType,
};

// --- test doubles ---

struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(1_000_000_000),
        })
    }

    fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PolicyLog {
    anr_calls: Vec<(Option<String>, Option<u64>)>,
    unhandled_keys: Vec<i32>,
    broken_channels: Vec<u64>,
    user_activity: Vec<u32>,
    switches: Vec<i32>,
    configuration_changes: Vec<i64>,
}

struct FakePolicy {
    log: Mutex<PolicyLog>,
    config: DispatcherConfig,
    intercept_result: Mutex<InterceptResult>,
    anr_reply: AtomicI64,
    fallback_key: Mutex<Option<KeyEvent>>,
    swallow_filtered: AtomicBool,
    injection_allowed: AtomicBool,
}

impl FakePolicy {
    fn new() -> Arc<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    fn with_config(config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(PolicyLog::default()),
            config,
            intercept_result: Mutex::new(InterceptResult::Continue),
            anr_reply: AtomicI64::new(0),
            fallback_key: Mutex::new(None),
            swallow_filtered: AtomicBool::new(false),
            injection_allowed: AtomicBool::new(true),
        })
    }
}

impl DispatchPolicy for FakePolicy {
    fn intercept_key_before_queueing(&self, _event: &KeyEvent, policy_flags: &mut PolicyFlags) {
        if !policy_flags.contains(PolicyFlags::INJECTED) {
            *policy_flags |= PolicyFlags::TRUSTED;
        }
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    fn intercept_generic_before_queueing(&self, _event_time: i64, policy_flags: &mut PolicyFlags) {
        if !policy_flags.contains(PolicyFlags::INJECTED) {
            *policy_flags |= PolicyFlags::TRUSTED;
        }
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    fn intercept_key_before_dispatching(
        &self,
        _channel_id: Option<u64>,
        _event: &KeyEvent,
    ) -> InterceptResult {
        *self.intercept_result.lock()
    }

    fn filter_input_event(&self, _event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        !self.swallow_filtered.load(Ordering::SeqCst)
    }

    fn notify_configuration_changed(&self, event_time: i64) {
        self.log.lock().configuration_changes.push(event_time);
    }

    fn notify_anr(&self, application: Option<&str>, channel_id: Option<u64>) -> i64 {
        self.log
            .lock()
            .anr_calls
            .push((application.map(String::from), channel_id));
        self.anr_reply.load(Ordering::SeqCst)
    }

    fn notify_input_channel_broken(&self, channel_id: u64) {
        self.log.lock().broken_channels.push(channel_id);
    }

    fn dispatch_unhandled_key(&self, _channel_id: Option<u64>, event: &KeyEvent) -> Option<KeyEvent> {
        self.log.lock().unhandled_keys.push(event.key_code);
        self.fallback_key.lock().clone()
    }

    fn poke_user_activity(&self, _event_time: i64, event_type: u32) {
        self.log.lock().user_activity.push(event_type);
    }

    fn notify_switch(&self, _event_time: i64, switch_code: i32, _switch_value: i32) {
        self.log.lock().switches.push(switch_code);
    }

    fn check_injection_permission(
        &self,
        _owner_uid: Option<i32>,
        _injector_pid: i32,
        _injector_uid: i32,
    ) -> bool {
        self.injection_allowed.load(Ordering::SeqCst)
    }

    fn get_dispatcher_configuration(&self) -> DispatcherConfig {
        self.config.clone()
    }
}

#[derive(Default)]
struct ChannelLog {
    keys: Vec<PublishedKey>,
    motions: Vec<PublishedMotion>,
    appended_samples: Vec<(i64, Vec<PointerCoords>)>,
    dispatch_signals: usize,
}

struct FakeChannel {
    id: u64,
    name: String,
    log: Mutex<ChannelLog>,
    finished_replies: Mutex<VecDeque<Result<bool, TransportError>>>,
    append_errors: Mutex<VecDeque<TransportError>>,
}

impl FakeChannel {
    fn new(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_owned(),
            log: Mutex::new(ChannelLog::default()),
            finished_replies: Mutex::new(VecDeque::new()),
            append_errors: Mutex::new(VecDeque::new()),
        })
    }

    fn script_finished(&self, reply: Result<bool, TransportError>) {
        self.finished_replies.lock().push_back(reply);
    }

    fn script_append_error(&self, error: TransportError) {
        self.append_errors.lock().push_back(error);
    }

    fn keys(&self) -> Vec<PublishedKey> {
        self.log.lock().keys.clone()
    }

    fn motions(&self) -> Vec<PublishedMotion> {
        self.log.lock().motions.clone()
    }

    fn appended_samples(&self) -> Vec<(i64, Vec<PointerCoords>)> {
        self.log.lock().appended_samples.clone()
    }
}

impl InputChannel for FakeChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn publish_key(&self, key: &PublishedKey) -> Result<(), TransportError> {
        self.log.lock().keys.push(key.clone());
        Ok(())
    }

    fn publish_motion(&self, motion: &PublishedMotion) -> Result<(), TransportError> {
        self.log.lock().motions.push(motion.clone());
        Ok(())
    }

    fn append_motion_sample(
        &self,
        event_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), TransportError> {
        if let Some(error) = self.append_errors.lock().pop_front() {
            return Err(error);
        }
        self.log
            .lock()
            .appended_samples
            .push((event_time, coords.to_vec()));
        Ok(())
    }

    fn send_dispatch_signal(&self) -> Result<(), TransportError> {
        self.log.lock().dispatch_signals += 1;
        Ok(())
    }

    fn receive_finished_signal(&self) -> Result<bool, TransportError> {
        self.finished_replies.lock().pop_front().unwrap_or(Ok(true))
    }
}

// --- fixtures ---

fn window(channel_id: u64, name: &str, frame: Rect) -> InputWindow {
    InputWindow {
        channel_id,
        name: name.to_owned(),
        frame,
        touchable_region: Region::rect(frame),
        layer: 0,
        visible: true,
        paused: false,
        has_focus: false,
        has_wallpaper: false,
        flags: WindowFlags::NOT_TOUCH_MODAL,
        window_type: WindowType::BaseApplication,
        dispatching_timeout: 5 * SECONDS,
        owner_pid: 100,
        owner_uid: 1000,
    }
}

fn key_event(event_time: i64, action: KeyAction, key_code: i32) -> KeyEvent {
    KeyEvent {
        event_time,
        device_id: 1,
        source: Source::KEYBOARD,
        policy_flags: PolicyFlags::empty(),
        action,
        flags: KeyFlags::empty(),
        key_code,
        scan_code: 0,
        meta_state: 0,
        repeat_count: 0,
        down_time: event_time,
    }
}

fn touch_event(event_time: i64, action: MotionAction, points: &[(u32, f32, f32)]) -> MotionEvent {
    MotionEvent {
        event_time,
        device_id: 1,
        source: Source::TOUCHSCREEN,
        policy_flags: PolicyFlags::empty(),
        action,
        flags: MotionFlags::empty(),
        meta_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time: event_time,
        pointer_properties: points.iter().map(|&(id, _, _)| PointerProperties { id }).collect(),
        pointer_coords: points
            .iter()
            .map(|&(_, x, y)| PointerCoords {
                x,
                y,
                pressure: 1.0,
                size: 0.0,
            })
            .collect(),
    }
}

fn hover_event(event_time: i64, action: MotionAction, x: f32, y: f32) -> MotionEvent {
    MotionEvent {
        source: Source::MOUSE,
        ..touch_event(event_time, action, &[(0, x, y)])
    }
}

/// Pump the dispatch loop until it has nothing immediately runnable.
fn pump(dispatcher: &Dispatcher) -> i64 {
    for _ in 0..32 {
        let next_wake = dispatcher.dispatch_once();
        if next_wake != 0 {
            return next_wake;
        }
    }
    panic!("dispatch loop did not settle");
}

struct Fixture {
    clock: Arc<TestClock>,
    policy: Arc<FakePolicy>,
    dispatcher: Dispatcher,
}

impl Fixture {
    fn new() -> Self {
        Self::with_policy(FakePolicy::new())
    }

    fn with_policy(policy: Arc<FakePolicy>) -> Self {
        let clock = TestClock::new();
        let dispatcher = Dispatcher::new(policy.clone(), clock.clone()).unwrap();
        Self {
            clock,
            policy,
            dispatcher,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now.load(Ordering::SeqCst)
    }

    /// One focused window over the whole display, backed by `channel`.
    fn set_focused_window(&self, channel: &Arc<FakeChannel>) {
        self.dispatcher
            .register_input_channel(channel.clone(), false)
            .unwrap();
        let mut w = window(
            channel.id(),
            &channel.name,
            Rect {
                left: 0.0,
                top: 0.0,
                right: 800.0,
                bottom: 600.0,
            },
        );
        w.has_focus = true;
        self.dispatcher.set_input_windows(vec![w]);
    }
}

// --- scenarios ---

#[test]
fn key_reaches_focused_window() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);

    let keys = chan.keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key_code, 29);
    assert_eq!(keys[0].action, KeyAction::Down);
    assert_eq!(keys[0].repeat_count, 0);
    assert_eq!(chan.log.lock().dispatch_signals, 1);
    assert_eq!(f.policy.log.lock().user_activity, vec![1]);
}

#[test]
fn policy_intercept_skip_drops_key() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);
    *f.policy.intercept_result.lock() = InterceptResult::Skip;

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);

    assert!(chan.keys().is_empty());
}

#[test]
fn keys_are_serialized_per_connection() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Up, 29));
    pump(&f.dispatcher);

    // The second key waits for the finished signal of the first.
    assert_eq!(chan.keys().len(), 1);
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
}

#[test]
fn touch_coordinates_are_window_relative() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.dispatcher.register_input_channel(chan.clone(), false).unwrap();
    let frame = Rect {
        left: 100.0,
        top: 50.0,
        right: 300.0,
        bottom: 250.0,
    };
    f.dispatcher.set_input_windows(vec![window(1, "app", frame)]);

    f.dispatcher
        .notify_motion(&touch_event(f.now(), MotionAction::Down, &[(0, 150.0, 80.0)]))
        .unwrap();
    pump(&f.dispatcher);

    let motions = chan.motions();
    assert_eq!(motions.len(), 1);
    assert_eq!(motions[0].action, MotionAction::Down);
    assert_eq!(motions[0].pointer_coords[0].x, 50.0);
    assert_eq!(motions[0].pointer_coords[0].y, 30.0);
    assert_eq!(f.policy.log.lock().user_activity, vec![2]);
}

#[test]
fn watch_outside_touch_gets_zeroed_coordinates() {
    let f = Fixture::new();
    let watcher = FakeChannel::new(1, "watcher");
    let app = FakeChannel::new(2, "app");
    f.dispatcher.register_input_channel(watcher.clone(), false).unwrap();
    f.dispatcher.register_input_channel(app.clone(), false).unwrap();

    let mut watcher_window = window(
        1,
        "watcher",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 100.0,
            bottom: 100.0,
        },
    );
    watcher_window.flags |= WindowFlags::WATCH_OUTSIDE_TOUCH;
    watcher_window.owner_uid = 2000;
    let app_window = window(
        2,
        "app",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 800.0,
            bottom: 600.0,
        },
    );
    f.dispatcher.set_input_windows(vec![watcher_window, app_window]);

    f.dispatcher
        .notify_motion(&touch_event(f.now(), MotionAction::Down, &[(0, 400.0, 300.0)]))
        .unwrap();
    pump(&f.dispatcher);

    let outside = watcher.motions();
    assert_eq!(outside.len(), 1);
    assert_eq!(outside[0].action, MotionAction::Outside);
    assert_eq!(outside[0].pointer_coords[0].x, 0.0);
    assert_eq!(outside[0].pointer_coords[0].y, 0.0);
    assert_eq!(app.motions()[0].action, MotionAction::Down);
}

#[test]
fn queued_moves_batch_into_one_dispatch() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    f.dispatcher
        .notify_motion(&touch_event(t0 + 20 * MILLIS, MotionAction::Move, &[(0, 30.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);

    let motions = chan.motions();
    assert_eq!(motions.len(), 2);
    assert_eq!(motions[1].action, MotionAction::Move);
    assert_eq!(motions[1].event_time, t0 + 10 * MILLIS);
    // The second move rode along as an appended sample.
    let samples = chan.appended_samples();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].0, t0 + 20 * MILLIS);
    assert_eq!(samples[0].1[0].x, 30.0);
}

#[test]
fn moves_stream_onto_in_flight_event() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    assert_eq!(chan.motions().len(), 2);

    // The move is in flight and unfinished; the next sample streams
    // onto it instead of being queued.
    f.dispatcher
        .notify_motion(&touch_event(t0 + 20 * MILLIS, MotionAction::Move, &[(0, 30.0, 10.0)]))
        .unwrap();
    assert_eq!(chan.motions().len(), 2);
    let samples = chan.appended_samples();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].1[0].x, 30.0);
}

#[test]
fn unsent_tail_is_redelivered_after_finish() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);

    // The consumer's buffer is full; the streamed sample stays queued.
    chan.script_append_error(TransportError::BufferFull);
    f.dispatcher
        .notify_motion(&touch_event(t0 + 20 * MILLIS, MotionAction::Move, &[(0, 30.0, 10.0)]))
        .unwrap();
    assert!(chan.appended_samples().is_empty());

    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);
    let motions = chan.motions();
    assert_eq!(motions.len(), 3);
    assert_eq!(motions[2].action, MotionAction::Move);
    assert_eq!(motions[2].event_time, t0 + 20 * MILLIS);
    assert_eq!(motions[2].pointer_coords[0].x, 30.0);
}

#[test]
fn device_repeat_folds_into_repeat_count() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    // The device sends a second identical down while the key is held.
    f.dispatcher.notify_key(&key_event(f.now() + 10 * MILLIS, KeyAction::Down, 29));
    pump(&f.dispatcher);

    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].repeat_count, 1);
    assert!(keys[1].flags.contains(KeyFlags::LONG_PRESS));
}

#[test]
fn held_key_repeats_on_the_synthetic_timer() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    let next_wake = pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();
    assert_eq!(next_wake, f.now() + 500 * MILLIS);

    f.clock.advance(500 * MILLIS);
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].repeat_count, 1);
    assert!(keys[1].flags.contains(KeyFlags::LONG_PRESS));

    f.clock.advance(50 * MILLIS);
    pump(&f.dispatcher);
    assert_eq!(chan.keys()[2].repeat_count, 2);
}

#[test]
fn app_switch_key_expedites_the_queue() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher.notify_key(&key_event(t0, KeyAction::Down, 29));
    f.dispatcher.notify_key(&key_event(t0 + MILLIS, KeyAction::Down, 3));
    f.dispatcher.notify_key(&key_event(t0 + 2 * MILLIS, KeyAction::Up, 3));

    // The switch timeout lapses before anything was dispatched.
    f.clock.advance(SECONDS);
    pump(&f.dispatcher);

    // Everything ahead of the home key was dropped.
    let keys = chan.keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key_code, 3);
    assert_eq!(keys[0].action, KeyAction::Up);
    assert_eq!(f.policy.log.lock().switches, vec![3]);
}

#[test]
fn stale_events_are_dropped() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    f.clock.advance(11 * SECONDS);
    pump(&f.dispatcher);

    assert!(chan.keys().is_empty());
}

#[test]
fn disabling_dispatch_cancels_held_keys() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher.set_input_dispatch_mode(false, false);

    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn parked_key_is_dropped_when_dispatch_turns_off() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);

    // The up waits behind the unfinished down when dispatch shuts off.
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Up, 29));
    pump(&f.dispatcher);
    f.dispatcher.set_input_dispatch_mode(false, false);
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);

    // Only the synthesized cancel goes out; the real up is discarded.
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn unresponsive_target_raises_anr_and_gets_canceled() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.dispatcher.register_input_channel(chan.clone(), false).unwrap();
    let mut w = window(
        1,
        "app",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 800.0,
            bottom: 600.0,
        },
    );
    w.has_focus = true;
    w.dispatching_timeout = 100 * MILLIS;
    f.dispatcher.set_input_windows(vec![w]);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    assert_eq!(chan.keys().len(), 1);

    // A second key cannot go out while the first is unfinished.
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Up, 29));
    let next_wake = pump(&f.dispatcher);
    assert_eq!(next_wake, f.now() + 100 * MILLIS);
    assert!(f.policy.log.lock().anr_calls.is_empty());

    // The deadline passes; the policy is told and gives up.
    f.clock.advance(200 * MILLIS);
    pump(&f.dispatcher);
    {
        let log = f.policy.log.lock();
        assert_eq!(log.anr_calls.len(), 1);
        assert_eq!(log.anr_calls[0].1, Some(1));
    }

    // The consumer eventually answers; the synthesized cancel for the
    // abandoned down key goes out next.
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn anr_reply_extends_the_deadline() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.dispatcher.register_input_channel(chan.clone(), false).unwrap();
    let mut w = window(
        1,
        "app",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 800.0,
            bottom: 600.0,
        },
    );
    w.has_focus = true;
    w.dispatching_timeout = 100 * MILLIS;
    f.dispatcher.set_input_windows(vec![w]);
    f.policy.anr_reply.store(SECONDS, Ordering::SeqCst);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Up, 29));
    pump(&f.dispatcher);

    f.clock.advance(200 * MILLIS);
    pump(&f.dispatcher);
    assert_eq!(f.policy.log.lock().anr_calls.len(), 1);

    // The policy granted more time; once the consumer answers, the
    // parked key goes out normally.
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(!keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn split_touch_routes_pointers_to_their_windows() {
    let f = Fixture::new();
    let left = FakeChannel::new(1, "left");
    let right = FakeChannel::new(2, "right");
    f.dispatcher.register_input_channel(left.clone(), false).unwrap();
    f.dispatcher.register_input_channel(right.clone(), false).unwrap();

    let mut left_window = window(
        1,
        "left",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 100.0,
            bottom: 200.0,
        },
    );
    left_window.flags |= WindowFlags::SPLIT_TOUCH;
    let mut right_window = window(
        2,
        "right",
        Rect {
            left: 100.0,
            top: 0.0,
            right: 200.0,
            bottom: 200.0,
        },
    );
    right_window.flags |= WindowFlags::SPLIT_TOUCH;
    f.dispatcher.set_input_windows(vec![left_window, right_window]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 50.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(
            t0 + 10 * MILLIS,
            MotionAction::PointerDown(1),
            &[(0, 50.0, 50.0), (1, 150.0, 50.0)],
        ))
        .unwrap();
    pump(&f.dispatcher);

    // The new pointer begins a fresh gesture in the right window, with
    // only its own pointer and window-relative coordinates.
    let right_motions = right.motions();
    assert_eq!(right_motions.len(), 1);
    assert_eq!(right_motions[0].action, MotionAction::Down);
    assert_eq!(right_motions[0].pointer_properties.len(), 1);
    assert_eq!(right_motions[0].pointer_properties[0].id, 1);
    assert_eq!(right_motions[0].pointer_coords[0].x, 50.0);

    // The left window sees its own pointer continue as a move.
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);
    let left_motions = left.motions();
    assert_eq!(left_motions.len(), 2);
    assert_eq!(left_motions[1].action, MotionAction::Move);
    assert_eq!(left_motions[1].pointer_properties.len(), 1);
    assert_eq!(left_motions[1].pointer_properties[0].id, 0);
}

#[test]
fn hover_transitions_between_windows() {
    let f = Fixture::new();
    let left = FakeChannel::new(1, "left");
    let right = FakeChannel::new(2, "right");
    f.dispatcher.register_input_channel(left.clone(), false).unwrap();
    f.dispatcher.register_input_channel(right.clone(), false).unwrap();
    f.dispatcher.set_input_windows(vec![
        window(
            1,
            "left",
            Rect {
                left: 0.0,
                top: 0.0,
                right: 100.0,
                bottom: 200.0,
            },
        ),
        window(
            2,
            "right",
            Rect {
                left: 100.0,
                top: 0.0,
                right: 200.0,
                bottom: 200.0,
            },
        ),
    ]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&hover_event(t0, MotionAction::HoverMove, 50.0, 50.0))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    let left_motions = left.motions();
    assert_eq!(left_motions.len(), 1);
    assert_eq!(left_motions[0].action, MotionAction::HoverEnter);

    f.dispatcher
        .notify_motion(&hover_event(t0 + 10 * MILLIS, MotionAction::HoverMove, 150.0, 50.0))
        .unwrap();
    pump(&f.dispatcher);

    assert_eq!(left.motions()[1].action, MotionAction::HoverExit);
    assert_eq!(right.motions()[0].action, MotionAction::HoverEnter);
}

#[test]
fn unhandled_key_dispatches_policy_fallback() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);
    *f.policy.fallback_key.lock() = Some(key_event(0, KeyAction::Down, 19));

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 92));
    pump(&f.dispatcher);
    chan.script_finished(Ok(false));
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);

    assert_eq!(f.policy.log.lock().unhandled_keys, vec![92]);
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].key_code, 19);
    assert!(keys[1].flags.contains(KeyFlags::FALLBACK));
}

#[test]
fn unhandled_repeats_do_not_latch_a_fallback() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);
    *f.policy.fallback_key.lock() = Some(key_event(0, KeyAction::Down, 19));

    // The initial down is handled, so no fallback latches.
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 92));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);

    // An unhandled repeat must not start a fallback mid-stream.
    f.dispatcher.notify_key(&key_event(f.now() + 10 * MILLIS, KeyAction::Down, 92));
    pump(&f.dispatcher);
    chan.script_finished(Ok(false));
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);

    // Neither must the unhandled up that ends the press.
    f.dispatcher.notify_key(&key_event(f.now() + 20 * MILLIS, KeyAction::Up, 92));
    pump(&f.dispatcher);
    chan.script_finished(Ok(false));
    f.dispatcher.handle_finished_signal(1).unwrap();
    pump(&f.dispatcher);

    assert!(f.policy.log.lock().unhandled_keys.is_empty());
    let keys = chan.keys();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| !k.flags.contains(KeyFlags::FALLBACK)));
}

#[test]
fn broken_channel_notifies_policy() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    chan.script_finished(Err(TransportError::Broken));
    assert!(matches!(
        f.dispatcher.handle_finished_signal(1),
        Err(input_dispatch::DispatchError::ChannelBroken(1))
    ));

    assert_eq!(f.policy.log.lock().broken_channels, vec![1]);
    // Nothing further is delivered to a broken connection.
    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Up, 29));
    pump(&f.dispatcher);
    assert_eq!(chan.keys().len(), 1);
}

#[test]
fn unregistering_discards_queued_events() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.unregister_input_channel(1).unwrap();

    assert!(matches!(
        f.dispatcher.handle_finished_signal(1),
        Err(input_dispatch::DispatchError::ChannelNotFound(1))
    ));
    assert!(matches!(
        f.dispatcher.unregister_input_channel(1),
        Err(input_dispatch::DispatchError::ChannelNotFound(1))
    ));
}

#[test]
fn duplicate_channel_registration_is_rejected() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.dispatcher.register_input_channel(chan.clone(), false).unwrap();
    assert!(matches!(
        f.dispatcher.register_input_channel(chan, false),
        Err(input_dispatch::DispatchError::ChannelExists(1))
    ));
}

#[test]
fn monitors_receive_copies_of_everything() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    let monitor = FakeChannel::new(99, "monitor");
    f.set_focused_window(&chan);
    f.dispatcher.register_input_channel(monitor.clone(), true).unwrap();

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();
    f.dispatcher.handle_finished_signal(99).unwrap();
    f.dispatcher
        .notify_motion(&touch_event(f.now(), MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);

    assert_eq!(monitor.keys().len(), 1);
    assert_eq!(monitor.motions().len(), 1);
}

#[test]
fn transfer_touch_focus_moves_the_gesture() {
    let f = Fixture::new();
    let source = FakeChannel::new(1, "source");
    let target = FakeChannel::new(2, "target");
    f.dispatcher.register_input_channel(source.clone(), false).unwrap();
    f.dispatcher.register_input_channel(target.clone(), false).unwrap();
    let frame = Rect {
        left: 0.0,
        top: 0.0,
        right: 800.0,
        bottom: 600.0,
    };
    f.dispatcher.set_input_windows(vec![window(1, "source", frame), window(2, "target", frame)]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();
    assert_eq!(source.motions().len(), 1);

    assert!(f.dispatcher.transfer_touch_focus(1, 2));

    // The source's gesture ends with a cancel.
    let source_motions = source.motions();
    assert_eq!(source_motions.len(), 2);
    assert_eq!(source_motions[1].action, MotionAction::Cancel);

    // Further motion goes to the transfer target.
    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    let target_motions = target.motions();
    assert_eq!(target_motions.len(), 1);
    assert_eq!(target_motions[0].action, MotionAction::Move);
}

#[test]
fn configuration_change_reaches_policy_in_order() {
    let f = Fixture::new();
    f.dispatcher.notify_configuration_changed(42);
    pump(&f.dispatcher);
    assert_eq!(f.policy.log.lock().configuration_changes, vec![42]);
}

#[test]
fn device_reset_cancels_only_that_device() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    // Resetting an unrelated device leaves the held key alone.
    f.dispatcher.notify_device_reset(f.now(), 7);
    pump(&f.dispatcher);
    assert_eq!(chan.keys().len(), 1);

    f.dispatcher.notify_device_reset(f.now(), 1);
    pump(&f.dispatcher);
    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn removing_a_touched_window_cancels_its_gesture() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher
        .notify_motion(&touch_event(f.now(), MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher.set_input_windows(Vec::new());

    let motions = chan.motions();
    assert_eq!(motions.len(), 2);
    assert_eq!(motions[1].action, MotionAction::Cancel);
}

#[test]
fn toggling_the_input_filter_cancels_held_state() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher.set_input_filter_enabled(true);

    let keys = chan.keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].action, KeyAction::Up);
    assert!(keys[1].flags.contains(KeyFlags::CANCELED));
}

#[test]
fn slippery_window_hands_the_gesture_off() {
    let f = Fixture::new();
    let left = FakeChannel::new(1, "left");
    let right = FakeChannel::new(2, "right");
    f.dispatcher.register_input_channel(left.clone(), false).unwrap();
    f.dispatcher.register_input_channel(right.clone(), false).unwrap();

    let mut left_window = window(
        1,
        "left",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 100.0,
            bottom: 200.0,
        },
    );
    left_window.flags |= WindowFlags::SLIPPERY;
    let right_window = window(
        2,
        "right",
        Rect {
            left: 100.0,
            top: 0.0,
            right: 200.0,
            bottom: 200.0,
        },
    );
    f.dispatcher.set_input_windows(vec![left_window, right_window]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 50.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 150.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);

    // The gesture slides off the slippery window and restarts in the
    // window under the pointer.
    assert_eq!(left.motions()[1].action, MotionAction::Cancel);
    let right_motions = right.motions();
    assert_eq!(right_motions.len(), 1);
    assert_eq!(right_motions[0].action, MotionAction::Down);
    assert_eq!(right_motions[0].pointer_coords[0].x, 50.0);
}

#[test]
fn slipped_from_window_does_not_gate_the_gesture() {
    let f = Fixture::new();
    let left = FakeChannel::new(1, "left");
    let right = FakeChannel::new(2, "right");
    f.dispatcher.register_input_channel(left.clone(), false).unwrap();
    f.dispatcher.register_input_channel(right.clone(), false).unwrap();

    let mut left_window = window(
        1,
        "left",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 100.0,
            bottom: 200.0,
        },
    );
    left_window.flags |= WindowFlags::SLIPPERY;
    let right_window = window(
        2,
        "right",
        Rect {
            left: 100.0,
            top: 0.0,
            right: 200.0,
            bottom: 200.0,
        },
    );
    f.dispatcher.set_input_windows(vec![left_window, right_window]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 50.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + 10 * MILLIS, MotionAction::Move, &[(0, 150.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);

    // The old window's cancel is still unfinished; only the new owner
    // answers.
    f.dispatcher.handle_finished_signal(2).unwrap();

    f.clock.advance(50 * MILLIS);
    f.dispatcher
        .notify_motion(&touch_event(f.now(), MotionAction::Move, &[(0, 160.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);

    // The gesture keeps flowing to the new owner without waiting on
    // the window it slid off of.
    let right_motions = right.motions();
    assert_eq!(right_motions.len(), 2);
    assert_eq!(right_motions[1].action, MotionAction::Move);
    assert_eq!(right_motions[1].pointer_coords[0].x, 60.0);
    assert_eq!(left.motions().len(), 2);
    assert!(f.policy.log.lock().anr_calls.is_empty());
}

#[test]
fn multi_pointer_move_stays_on_the_slippery_window() {
    let f = Fixture::new();
    let left = FakeChannel::new(1, "left");
    let right = FakeChannel::new(2, "right");
    f.dispatcher.register_input_channel(left.clone(), false).unwrap();
    f.dispatcher.register_input_channel(right.clone(), false).unwrap();

    let mut left_window = window(
        1,
        "left",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 100.0,
            bottom: 200.0,
        },
    );
    left_window.flags |= WindowFlags::SLIPPERY;
    let right_window = window(
        2,
        "right",
        Rect {
            left: 100.0,
            top: 0.0,
            right: 200.0,
            bottom: 200.0,
        },
    );
    f.dispatcher.set_input_windows(vec![left_window, right_window]);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 50.0, 50.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(
            t0 + 10 * MILLIS,
            MotionAction::PointerDown(1),
            &[(0, 50.0, 50.0), (1, 60.0, 50.0)],
        ))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    // The first pointer wanders off the slippery window while the
    // second is still down; a multi-pointer gesture never hands off.
    f.dispatcher
        .notify_motion(&touch_event(
            t0 + 20 * MILLIS,
            MotionAction::Move,
            &[(0, 150.0, 50.0), (1, 60.0, 50.0)],
        ))
        .unwrap();
    pump(&f.dispatcher);

    assert!(right.motions().is_empty());
    let left_motions = left.motions();
    assert_eq!(left_motions.len(), 3);
    assert_eq!(left_motions[2].action, MotionAction::Move);
}

#[test]
fn nearby_samples_coalesce_when_throttling() {
    let mut config = DispatcherConfig::default();
    config.max_events_per_second = 100;
    let f = Fixture::with_policy(FakePolicy::with_config(config));
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    // Two moves 1ms apart while throttling: the second replaces the
    // first's sample instead of extending the batch.
    f.dispatcher
        .notify_motion(&touch_event(t0 + MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    f.dispatcher
        .notify_motion(&touch_event(t0 + 2 * MILLIS, MotionAction::Move, &[(0, 30.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);

    let motions = chan.motions();
    assert_eq!(motions.len(), 2);
    assert_eq!(motions[1].event_time, t0 + 2 * MILLIS);
    assert_eq!(motions[1].pointer_coords[0].x, 30.0);
    assert!(chan.appended_samples().is_empty());
}

#[test]
fn input_filter_swallows_events() {
    let f = Fixture::new();
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);
    f.dispatcher.set_input_filter_enabled(true);
    f.policy.swallow_filtered.store(true, Ordering::SeqCst);

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    pump(&f.dispatcher);
    assert!(chan.keys().is_empty());
}

#[test]
fn throttled_moves_wait_for_the_interval() {
    let mut config = DispatcherConfig::default();
    config.max_events_per_second = 100;
    let f = Fixture::with_policy(FakePolicy::with_config(config));
    let chan = FakeChannel::new(1, "app");
    f.set_focused_window(&chan);

    let t0 = f.now();
    f.dispatcher
        .notify_motion(&touch_event(t0, MotionAction::Down, &[(0, 10.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();

    f.dispatcher
        .notify_motion(&touch_event(t0 + MILLIS, MotionAction::Move, &[(0, 20.0, 10.0)]))
        .unwrap();
    pump(&f.dispatcher);
    f.dispatcher.handle_finished_signal(1).unwrap();
    assert_eq!(chan.motions().len(), 2);

    // The next move arrives 1ms later; at 100 events/sec it must wait.
    f.dispatcher
        .notify_motion(&touch_event(t0 + 2 * MILLIS, MotionAction::Move, &[(0, 30.0, 10.0)]))
        .unwrap();
    let next_wake = pump(&f.dispatcher);
    assert_eq!(chan.motions().len(), 2);
    assert_eq!(next_wake, t0 + 10 * MILLIS);

    f.clock.advance(10 * MILLIS);
    pump(&f.dispatcher);
    assert_eq!(chan.motions().len(), 3);
}

#[test]
fn rejects_malformed_motion_events() {
    let f = Fixture::new();
    let mut event = touch_event(f.now(), MotionAction::Down, &[(0, 10.0, 10.0)]);
    event.pointer_coords.clear();
    assert!(f.dispatcher.notify_motion(&event).is_err());
}

#[test]
fn synchronous_injection_reports_failure_without_targets() {
    let policy = FakePolicy::new();
    let clock = Arc::new(input_dispatch::MonotonicClock::new());
    let dispatcher = Arc::new(Dispatcher::new(policy, clock).unwrap());
    let thread = DispatcherThread::start(dispatcher.clone());

    // No focused window, no focused application: immediate failure.
    let result = dispatcher.inject_event(
        &InputEvent::Key(key_event(1, KeyAction::Down, 29)),
        42,
        1000,
        InjectionSyncMode::WaitForResult,
        SECONDS,
    );
    assert_eq!(result, InjectionResult::Failed);
    thread.stop();
}

#[test]
fn untrusted_injection_into_foreign_window_is_denied() {
    let policy = FakePolicy::new();
    policy.injection_allowed.store(false, Ordering::SeqCst);
    let clock = Arc::new(input_dispatch::MonotonicClock::new());
    let dispatcher = Arc::new(Dispatcher::new(policy, clock).unwrap());
    let chan = FakeChannel::new(1, "app");
    dispatcher.register_input_channel(chan, false).unwrap();
    let mut w = window(
        1,
        "app",
        Rect {
            left: 0.0,
            top: 0.0,
            right: 800.0,
            bottom: 600.0,
        },
    );
    w.has_focus = true;
    w.owner_uid = 1000;
    dispatcher.set_input_windows(vec![w]);
    let thread = DispatcherThread::start(dispatcher.clone());

    let result = dispatcher.inject_event(
        &InputEvent::Key(key_event(1, KeyAction::Down, 29)),
        42,
        2000,
        InjectionSyncMode::WaitForResult,
        SECONDS,
    );
    assert_eq!(result, InjectionResult::PermissionDenied);
    thread.stop();
}

#[test]
fn waiting_for_focused_application_raises_anr() {
    let f = Fixture::new();
    f.dispatcher.set_focused_application(Some(InputApplication {
        name: "starting-app".into(),
        dispatching_timeout: 100 * MILLIS,
    }));

    f.dispatcher.notify_key(&key_event(f.now(), KeyAction::Down, 29));
    let next_wake = pump(&f.dispatcher);
    assert_eq!(next_wake, f.now() + 100 * MILLIS);

    f.clock.advance(200 * MILLIS);
    pump(&f.dispatcher);
    let log = f.policy.log.lock();
    assert_eq!(log.anr_calls.len(), 1);
    assert_eq!(log.anr_calls[0].0.as_deref(), Some("starting-app"));
}
