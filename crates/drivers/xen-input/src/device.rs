//! Keyboard/pointer frontend lifecycle.
//!
//! Probe grants the event page, opens its port, publishes both together with
//! `request-abs-pointer`, runs the xenbus handshake and only then starts the
//! drain task. Shutdown stops the task before closing the connection.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use xen_transport::{enumerate, DeviceKey, EventConsumer, Frontend, GrantTable, XenStore};
use xf_hal::{HalError, XenHal};
use xf_utils::{Mutex, Registry};

use input_device::PointerSink;

use crate::dispatcher::{DispatchTelemetry, InputDispatcher};
use crate::protocol::KbdLayout;
use crate::scancode::{ScancodeQueue, ScancodeReader};
use crate::InputError;

const CLASS: &str = "vkbd";

pub type KbdEvents<H> = EventConsumer<H, KbdLayout>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputConfig {
    /// Ask the backend for absolute pointer positions.
    pub request_abs_pointer: bool,
    pub handshake_retry_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            request_abs_pointer: true,
            handshake_retry_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InputTelemetry {
    /// Records consumed from the event ring.
    pub events: u64,
    pub dispatch: DispatchTelemetry,
    /// Scancodes overwritten before anyone read them.
    pub scancodes_dropped: u64,
}

/// State shared between the device and its drain task.
struct DrainTask<H: XenHal, P: PointerSink> {
    hal: Arc<H>,
    events: KbdEvents<H>,
    dispatcher: Mutex<InputDispatcher<P>>,
    consumed: AtomicU64,
    started: AtomicBool,
    stop: AtomicBool,
    exited: AtomicBool,
}

impl<H: XenHal, P: PointerSink + 'static> DrainTask<H, P> {
    fn start(self: &Arc<Self>) -> Result<(), HalError> {
        let me = self.clone();
        self.started.store(true, Ordering::Release);
        let spawned = self.hal.spawn("vkbd_drain", Box::new(move || me.run()));
        if spawned.is_err() {
            self.started.store(false, Ordering::Release);
        }
        spawned
    }

    fn run(&self) {
        log::debug!("[VKBD] drain task started");
        loop {
            let drained = self.events.wait_and_drain(
                || self.stop.load(Ordering::Acquire),
                |ev| {
                    let msec = self.hal.now_ms();
                    self.dispatcher.lock().dispatch(ev, msec);
                },
            );
            match drained {
                Some(n) => {
                    self.consumed.fetch_add(u64::from(n), Ordering::Relaxed);
                }
                None => break,
            }
        }
        self.exited.store(true, Ordering::Release);
        log::debug!("[VKBD] drain task exited");
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.exited.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.events.kick();
        while self.is_running() {
            self.hal.idle();
        }
    }
}

pub struct VirtualInput<H: XenHal, S: XenStore + ?Sized, P: PointerSink + 'static> {
    hal: Arc<H>,
    frontend: Frontend<S>,
    key: DeviceKey,
    config: InputConfig,
    task: Arc<DrainTask<H, P>>,
    scancodes: Arc<ScancodeQueue>,
    state: Mutex<InputState>,
}

impl<H: XenHal, S: XenStore + ?Sized, P: PointerSink + 'static> VirtualInput<H, S, P> {
    /// Bring up `device/vkbd/<index>`, delivering pointer events to `sink`.
    ///
    /// Blocks until the backend reports Connected.
    pub fn probe(
        hal: &Arc<H>,
        grants: &Arc<GrantTable>,
        store: &Arc<S>,
        index: u32,
        config: InputConfig,
        sink: P,
    ) -> Result<Arc<Self>, InputError> {
        let frontend = Frontend::new(store.clone(), CLASS, index);
        let backend = frontend.backend_id()?;
        let events: KbdEvents<H> = EventConsumer::new(hal, grants, backend)?;

        frontend.write_int("page-gref", events.gref().raw())?;
        frontend.write_int("event-channel", events.port())?;
        if config.request_abs_pointer {
            frontend.write("request-abs-pointer", "1")?;
        }
        frontend.connect(&**hal, config.handshake_retry_ms)?;

        let scancodes = Arc::new(ScancodeQueue::new());
        let task = Arc::new(DrainTask {
            hal: hal.clone(),
            events,
            dispatcher: Mutex::new(InputDispatcher::new(sink, scancodes.clone())),
            consumed: AtomicU64::new(0),
            started: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        if let Err(e) = task.start() {
            log::error!("[VKBD] {}: drain task: {}", frontend.node(), e);
            if let Err(close) = frontend.close(&**hal, config.handshake_retry_ms) {
                log::warn!("[VKBD] {}: close during rollback: {}", frontend.node(), close);
            }
            return Err(e.into());
        }
        log::info!("[VKBD] {}: ready", frontend.node());

        Ok(Arc::new(Self {
            hal: hal.clone(),
            frontend,
            key: DeviceKey { backend, index },
            config,
            task,
            scancodes,
            state: Mutex::new(InputState::Connected),
        }))
    }

    /// Stop event delivery and close the connection.
    pub fn shutdown(&self) -> Result<(), InputError> {
        {
            let mut state = self.state.lock();
            if *state != InputState::Connected {
                return Err(InputError::NotConnected);
            }
            *state = InputState::Closing;
        }
        log::info!("[VKBD] {}: shutting down", self.frontend.node());
        self.task.stop();
        self.frontend.close(&*self.hal, self.config.handshake_retry_ms)?;
        *self.state.lock() = InputState::Closed;
        Ok(())
    }

    /// Open the scancode stream. Fails with `InUse` while another reader is open.
    pub fn open_scancodes(&self) -> Result<ScancodeReader, InputError> {
        self.scancodes.open()
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn state(&self) -> InputState {
        *self.state.lock()
    }

    pub fn telemetry(&self) -> InputTelemetry {
        InputTelemetry {
            events: self.task.consumed.load(Ordering::Relaxed),
            dispatch: self.task.dispatcher.lock().telemetry(),
            scancodes_dropped: self.scancodes.dropped(),
        }
    }
}

impl<H: XenHal, S: XenStore + ?Sized, P: PointerSink + 'static> Drop for VirtualInput<H, S, P> {
    fn drop(&mut self) {
        if self.task.is_running() {
            log::warn!("[VKBD] {}: dropped while connected", self.frontend.node());
            self.task.stop();
        }
    }
}

/// Connected input devices by backend and frontend index.
pub type InputRegistry<H, S, P> = Registry<DeviceKey, Arc<VirtualInput<H, S, P>>>;

/// Probe every `device/vkbd/<n>`, asking `make_sink` for each device's pointer
/// sink. Failures are logged and skipped. Returns the number added.
pub fn probe_all<H: XenHal, S: XenStore + ?Sized, P: PointerSink + 'static>(
    hal: &Arc<H>,
    grants: &Arc<GrantTable>,
    store: &Arc<S>,
    config: &InputConfig,
    registry: &InputRegistry<H, S, P>,
    mut make_sink: impl FnMut(u32) -> P,
) -> usize {
    let mut added = 0;
    for index in enumerate(&**store, CLASS) {
        match VirtualInput::probe(hal, grants, store, index, *config, make_sink(index)) {
            Ok(input) => {
                registry.insert(input.key(), input);
                added += 1;
            }
            Err(e) => log::error!("[VKBD] device/{}/{}: {}", CLASS, index, e),
        }
    }
    added
}

/// Shut down and forget every device in `registry`.
pub fn shutdown_all<H: XenHal, S: XenStore + ?Sized, P: PointerSink + 'static>(registry: &InputRegistry<H, S, P>) {
    for (key, input) in registry.drain() {
        if let Err(e) = input.shutdown() {
            log::error!("[VKBD] {:?}: shutdown failed: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InputRecord, KbdEvent, BTN_LEFT};
    use alloc::format;
    use core::ptr::NonNull;
    use input_device::{Buttons, PointerEvent};
    use std::sync::PoisonError;
    use std::time::{Duration, Instant};
    use std::vec::Vec;
    use xen_transport::mock::MockStore;
    use xen_transport::{EventRing, GrantRef};
    use xf_hal::mock::MockHal;

    type Log = Arc<std::sync::Mutex<Vec<PointerEvent>>>;
    type Sink = Box<dyn FnMut(PointerEvent) + Send>;

    struct Rig {
        hal: Arc<MockHal>,
        grants: Arc<GrantTable>,
        store: Arc<MockStore>,
    }

    fn add_node(store: &MockStore, index: u32) {
        let node = format!("device/vkbd/{index}");
        let back = format!("backend/vkbd/0/{index}");
        store.set(&format!("{node}/backend-id"), "0");
        store.set(&format!("{node}/backend"), &back);
        store.set(&format!("{back}/state"), "2");
        store.follow_frontend(&node, &back);
    }

    fn rig() -> Rig {
        let hal = MockHal::new();
        let grants = Arc::new(GrantTable::setup(&*hal, 1).unwrap());
        let store = MockStore::new();
        add_node(&store, 0);
        Rig { hal, grants, store }
    }

    fn fast() -> InputConfig {
        InputConfig {
            handshake_retry_ms: 1,
            ..InputConfig::default()
        }
    }

    fn recording_sink() -> (Sink, Log) {
        let log: Log = Arc::default();
        let sink: Sink = {
            let log = log.clone();
            Box::new(move |ev: PointerEvent| log.lock().unwrap_or_else(PoisonError::into_inner).push(ev))
        };
        (sink, log)
    }

    /// Produce `records` on the event page published by `device/vkbd/<index>`
    /// and raise its port.
    fn send(r: &Rig, index: u32, records: &[InputRecord]) {
        let node = format!("device/vkbd/{index}");
        let gref: u32 = r.store.get(&format!("{node}/page-gref")).unwrap().parse().unwrap();
        let port: u32 = r.store.get(&format!("{node}/event-channel")).unwrap().parse().unwrap();
        let page = r.hal.frame_ptr(r.grants.frame_of(GrantRef(gref))).unwrap();
        // SAFETY: the page stays granted while the device under test is alive
        let ring = unsafe { EventRing::<KbdLayout>::new(NonNull::new(page).unwrap()) };
        for &record in records {
            assert!(ring.produce(&KbdEvent::encode(record)));
        }
        r.hal.raise(port);
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_handshake_publishes_page_and_port() {
        let r = rig();
        let (sink, _log) = recording_sink();
        let input = VirtualInput::probe(&r.hal, &r.grants, &r.store, 0, fast(), sink).unwrap();
        assert_eq!(input.state(), InputState::Connected);
        assert_eq!(input.key(), DeviceKey { backend: 0, index: 0 });

        let keys = r.store.writes();
        let names: Vec<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            [
                "device/vkbd/0/page-gref",
                "device/vkbd/0/event-channel",
                "device/vkbd/0/request-abs-pointer",
                "device/vkbd/0/state",
                "device/vkbd/0/state",
            ]
        );
        assert_eq!(keys[2].1, "1");
        assert_eq!(r.store.get("device/vkbd/0/state").as_deref(), Some("4"));
        input.shutdown().unwrap();
    }

    #[test]
    fn test_abs_pointer_request_is_optional() {
        let r = rig();
        let (sink, _log) = recording_sink();
        let config = InputConfig {
            request_abs_pointer: false,
            ..fast()
        };
        let input = VirtualInput::probe(&r.hal, &r.grants, &r.store, 0, config, sink).unwrap();
        assert!(r.store.get("device/vkbd/0/request-abs-pointer").is_none());
        input.shutdown().unwrap();
    }

    #[test]
    fn test_events_reach_sink_and_scancodes() {
        let r = rig();
        let (sink, log) = recording_sink();
        let input = VirtualInput::probe(&r.hal, &r.grants, &r.store, 0, fast(), sink).unwrap();
        let mut reader = input.open_scancodes().unwrap();

        send(
            &r,
            0,
            &[
                InputRecord::Motion { rel_x: 4, rel_y: -1, rel_z: 1 },
                InputRecord::Key { pressed: true, keycode: BTN_LEFT },
                InputRecord::Key { pressed: true, keycode: 16 },
                InputRecord::Key { pressed: false, keycode: 16 },
                InputRecord::Position { abs_x: 100, abs_y: 50, rel_z: 0 },
            ],
        );
        wait_until(|| input.telemetry().events == 5);

        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PointerEvent::Relative { dx: 4, dy: -1, .. }));
        assert_eq!(events[0].buttons(), Buttons::WHEEL_UP);
        assert_eq!(events[1].buttons(), Buttons::WHEEL_UP | Buttons::LEFT);
        assert!(matches!(events[2], PointerEvent::Absolute { x: 100, y: 50, .. }));

        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out), 2);
        assert_eq!(&out[..2], &[16, 0x90]);
        assert!(matches!(input.open_scancodes(), Err(InputError::InUse)));
        drop(reader);
        assert!(input.open_scancodes().is_ok());

        let t = input.telemetry();
        assert_eq!((t.dispatch.pointer_events, t.dispatch.scancodes), (3, 2));
        input.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let r = rig();
        let (sink, _log) = recording_sink();
        let input = VirtualInput::probe(&r.hal, &r.grants, &r.store, 0, fast(), sink).unwrap();
        let port: u32 = r.store.get("device/vkbd/0/event-channel").unwrap().parse().unwrap();

        input.shutdown().unwrap();
        assert_eq!(input.state(), InputState::Closed);
        assert_eq!(input.shutdown(), Err(InputError::NotConnected));
        let states: Vec<_> = r
            .store
            .writes()
            .into_iter()
            .filter(|(k, _)| k == "device/vkbd/0/state")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(states, ["3", "4", "5", "6"]);

        drop(input);
        r.hal.join_tasks();
        assert!(!r.hal.is_open(port));
        assert_eq!(r.grants.available(), r.grants.capacity());
        assert_eq!(r.hal.live_regions(), 0);
    }

    #[test]
    fn test_spawn_failure_closes_connection() {
        let r = rig();
        let (sink, _log) = recording_sink();
        r.hal.fail_spawns();
        let result = VirtualInput::probe(&r.hal, &r.grants, &r.store, 0, fast(), sink);
        assert_eq!(result.err(), Some(InputError::Hal(HalError::Spawn)));

        let states: Vec<_> = r
            .store
            .writes()
            .into_iter()
            .filter(|(k, _)| k == "device/vkbd/0/state")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(states, ["3", "4", "5", "6"]);
        assert_eq!(r.store.get("device/vkbd/0/state").as_deref(), Some("6"));
        r.hal.join_tasks();
        assert_eq!(r.grants.available(), r.grants.capacity());
        assert_eq!(r.hal.live_regions(), 0);
    }

    #[test]
    fn test_missing_backend_id() {
        let r = rig();
        let (sink, _log) = recording_sink();
        let result = VirtualInput::probe(&r.hal, &r.grants, &r.store, 3, fast(), sink);
        assert!(matches!(result, Err(InputError::Xenbus(_))));
        assert_eq!(r.hal.live_regions(), 0);
    }

    #[test]
    fn test_probe_all_and_shutdown_all() {
        let r = rig();
        add_node(&r.store, 2);
        let registry: InputRegistry<MockHal, MockStore, Sink> = InputRegistry::new();
        let mut asked = Vec::new();
        let added = probe_all(&r.hal, &r.grants, &r.store, &fast(), &registry, |index| {
            asked.push(index);
            recording_sink().0
        });
        assert_eq!(added, 2);
        assert_eq!(asked, [0, 2]);

        let second = registry.get(&DeviceKey { backend: 0, index: 2 }).unwrap();
        shutdown_all(&registry);
        assert!(registry.is_empty());
        assert_eq!(second.state(), InputState::Closed);
        drop(second);
        r.hal.join_tasks();
        assert_eq!(r.grants.available(), r.grants.capacity());
    }
}
