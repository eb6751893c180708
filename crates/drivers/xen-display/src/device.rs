//! Display frontend lifecycle.
//!
//! Probe order: buffers and directory, event and control rings, publish the
//! ring references, xenbus handshake, DBUF_CREATE, FB_ATTACH, SET_CONFIG,
//! then the flip task. Shutdown runs it backwards; grants are revoked and
//! memory freed when the last reference to the device is dropped. A failure
//! after the handshake detaches and destroys whatever was already created on
//! the backend and closes the connection before the error is returned.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use xen_transport::{enumerate, ControlChannel, DeviceKey, EventConsumer, Frontend, GrantTable, XenStore};
use xf_hal::XenHal;
use xf_utils::{Mutex, Registry};

use crate::config::{DisplayConfig, Geometry, Resolution};
use crate::flip::{DisplChannel, DisplEvents, FlipController, FlipTelemetry};
use crate::framebuffer::FrameBuffers;
use crate::protocol::{Command, DbufCreate, DisplResponse, FbAttach, PixelFormat, SetConfig};
use crate::DisplayError;

const CLASS: &str = "vdispl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTelemetry {
    pub requests: u64,
    pub responses: u64,
    pub failed_status: u64,
    pub flip: FlipTelemetry,
}

/// Backend objects created so far during bring-up.
#[derive(Debug, Default, Clone, Copy)]
struct Created {
    dbuf: bool,
    fb: bool,
}

pub struct VirtualDisplay<H: XenHal, S: XenStore + ?Sized> {
    hal: Arc<H>,
    frontend: Frontend<S>,
    key: DeviceKey,
    config: DisplayConfig,
    resolution: Resolution,
    flip: Arc<FlipController<H>>,
    control: Arc<DisplChannel<H>>,
    events: Arc<DisplEvents<H>>,
    buffers: Arc<FrameBuffers<H>>,
    state: Mutex<DisplayState>,
}

impl<H: XenHal, S: XenStore + ?Sized> VirtualDisplay<H, S> {
    /// Bring up `device/vdispl/<index>` and start flipping.
    ///
    /// Blocks until the backend reports Connected.
    pub fn probe(
        hal: &Arc<H>,
        grants: &Arc<GrantTable>,
        store: &Arc<S>,
        index: u32,
        config: DisplayConfig,
    ) -> Result<Arc<Self>, DisplayError> {
        let frontend = Frontend::new(store.clone(), CLASS, index);
        let backend = frontend.backend_id()?;
        let connector = config.connector;
        let resolution: Resolution = frontend.read(&format!("{connector}/resolution"))?.parse()?;
        let format = PixelFormat::select(config.fourcc);
        log::info!(
            "[VDISPL] {}: resolution {}x{}x{}, format {}",
            frontend.node(),
            resolution.width,
            resolution.height,
            format.bpp(),
            format.name()
        );

        let geometry = Geometry::new(resolution, format.bpp(), config.stride);
        geometry.buffer_sz()?;
        let buffers = Arc::new(FrameBuffers::new(hal, grants, backend, geometry, format)?);
        let events: Arc<DisplEvents<H>> = Arc::new(EventConsumer::new(hal, grants, backend)?);
        let control: Arc<DisplChannel<H>> = Arc::new(ControlChannel::new(hal, grants, backend)?);

        frontend.write(&format!("{connector}/resolution"), &resolution.to_string())?;
        frontend.write_int(&format!("{connector}/evt-event-channel"), events.port())?;
        frontend.write_int(&format!("{connector}/evt-ring-ref"), events.gref().raw())?;
        frontend.write_int(&format!("{connector}/req-event-channel"), control.port())?;
        frontend.write_int(&format!("{connector}/req-ring-ref"), control.gref().raw())?;
        frontend.connect(&**hal, config.handshake_retry_ms)?;

        let flip = FlipController::new(hal, &control, &events, &buffers, config.fb_cookie, config.flip_period_ms);
        let display = Self {
            hal: hal.clone(),
            frontend,
            key: DeviceKey { backend, index },
            config,
            resolution,
            flip,
            control,
            events,
            buffers,
            state: Mutex::new(DisplayState::Connected),
        };
        let mut created = Created::default();
        let started = display
            .create_framebuffer(&mut created)
            .and_then(|()| display.flip.start().map_err(DisplayError::from));
        if let Err(e) = started {
            log::error!("[VDISPL] {}: bring-up failed: {}", display.frontend.node(), e);
            display.roll_back(created);
            return Err(e);
        }
        log::info!("[VDISPL] {}: ready", display.frontend.node());
        Ok(Arc::new(display))
    }

    fn request(&self, cmd: Command) -> Result<DisplResponse, DisplayError> {
        log::debug!("[VDISPL] {}: {:?}", self.frontend.node(), cmd.operation());
        Ok(self.control.call(cmd.to_request())?)
    }

    fn create_framebuffer(&self, created: &mut Created) -> Result<(), DisplayError> {
        let g = self.buffers.geometry();
        let c = &self.config;
        self.request(Command::DbufCreate(DbufCreate {
            dbuf_cookie: c.dbuf_cookie,
            width: g.width,
            height: g.height,
            bpp: g.bpp,
            buffer_sz: g.buffer_sz()?,
            flags: 0,
            gref_directory: self.buffers.directory().raw(),
            data_ofs: 0,
            reserved: 0,
        }))?;
        created.dbuf = true;
        self.request(Command::FbAttach(FbAttach {
            dbuf_cookie: c.dbuf_cookie,
            fb_cookie: c.fb_cookie,
            width: g.width,
            height: g.height,
            pixel_format: self.buffers.format().fourcc(),
            reserved: 0,
        }))?;
        created.fb = true;
        self.request(Command::SetConfig(SetConfig {
            fb_cookie: c.fb_cookie,
            x: 0,
            y: 0,
            width: g.width,
            height: g.height,
            bpp: g.bpp,
            reserved: 0,
        }))?;
        Ok(())
    }

    /// Undo whatever a failed bring-up left behind on the backend and take the
    /// connection through Closing to Closed. Every step is attempted; errors
    /// are logged.
    fn roll_back(&self, created: Created) {
        *self.state.lock() = DisplayState::Closing;
        let node = self.frontend.node();
        if created.fb {
            let detach = Command::FbDetach {
                fb_cookie: self.config.fb_cookie,
            };
            if let Err(e) = self.request(detach) {
                log::warn!("[VDISPL] {}: FB_DETACH during rollback: {}", node, e);
            }
        }
        if created.dbuf {
            let destroy = Command::DbufDestroy {
                dbuf_cookie: self.config.dbuf_cookie,
            };
            if let Err(e) = self.request(destroy) {
                log::warn!("[VDISPL] {}: DBUF_DESTROY during rollback: {}", node, e);
            }
        }
        if let Err(e) = self.frontend.close(&*self.hal, self.config.handshake_retry_ms) {
            log::warn!("[VDISPL] {}: close during rollback: {}", node, e);
        }
        *self.state.lock() = DisplayState::Closed;
    }

    /// Stop flipping, release the framebuffer on the backend and close the
    /// connection.
    pub fn shutdown(&self) -> Result<(), DisplayError> {
        {
            let mut state = self.state.lock();
            if *state != DisplayState::Connected {
                return Err(DisplayError::NotConnected);
            }
            *state = DisplayState::Closing;
        }
        log::info!("[VDISPL] {}: shutting down", self.frontend.node());
        self.flip.stop();
        self.request(Command::FbDetach {
            fb_cookie: self.config.fb_cookie,
        })?;
        self.request(Command::DbufDestroy {
            dbuf_cookie: self.config.dbuf_cookie,
        })?;
        self.frontend.close(&*self.hal, self.config.handshake_retry_ms)?;
        *self.state.lock() = DisplayState::Closed;
        Ok(())
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn state(&self) -> DisplayState {
        *self.state.lock()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.buffers.format()
    }

    /// The producer's view of the frame.
    pub fn buffers(&self) -> &Arc<FrameBuffers<H>> {
        &self.buffers
    }

    pub fn update(&self) {
        self.buffers.update();
    }

    pub fn blank(&self) {
        self.buffers.blank();
    }

    pub fn telemetry(&self) -> DisplayTelemetry {
        let stats = self.control.stats();
        DisplayTelemetry {
            requests: stats.requests.load(Ordering::Relaxed),
            responses: stats.responses.load(Ordering::Relaxed),
            failed_status: stats.failed_status.load(Ordering::Relaxed),
            flip: self.flip.telemetry(),
        }
    }

    /// Pending flip-completion events, for diagnostics.
    pub fn pending_events(&self) -> u32 {
        self.events.available()
    }
}

impl<H: XenHal, S: XenStore + ?Sized> Drop for VirtualDisplay<H, S> {
    fn drop(&mut self) {
        if self.flip.is_running() {
            log::warn!("[VDISPL] {}: dropped while connected", self.frontend.node());
            self.flip.stop();
        }
    }
}

/// Connected displays by backend and frontend index.
pub type DisplayRegistry<H, S> = Registry<DeviceKey, Arc<VirtualDisplay<H, S>>>;

/// Probe every `device/vdispl/<n>` in the store. Failures are logged and
/// skipped. Returns the number of displays added to `registry`.
pub fn probe_all<H: XenHal, S: XenStore + ?Sized>(
    hal: &Arc<H>,
    grants: &Arc<GrantTable>,
    store: &Arc<S>,
    config: &DisplayConfig,
    registry: &DisplayRegistry<H, S>,
) -> usize {
    let mut added = 0;
    for index in enumerate(&**store, CLASS) {
        match VirtualDisplay::probe(hal, grants, store, index, *config) {
            Ok(display) => {
                registry.insert(display.key(), display);
                added += 1;
            }
            Err(e) => log::error!("[VDISPL] device/{}/{}: {}", CLASS, index, e),
        }
    }
    added
}

/// Shut down and forget every display in `registry`.
pub fn shutdown_all<H: XenHal, S: XenStore + ?Sized>(registry: &DisplayRegistry<H, S>) {
    for (key, display) in registry.drain() {
        if let Err(e) = display.shutdown() {
            log::error!("[VDISPL] {:?}: shutdown failed: {}", key, e);
        }
    }
}
