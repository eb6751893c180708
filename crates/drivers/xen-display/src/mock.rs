//! Display backend stand-in: answers control requests, emits flip
//! completions and reads back the device buffer through its grants.

extern crate std;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::format;
use std::string::String;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::vec::Vec;

use xen_transport::event::EventRing;
use xen_transport::mock::{ControlResponder, MockStore};
use xen_transport::page_dir::parse_directory_page;
use xen_transport::{GrantRef, GrantTable};
use xf_hal::mock::MockHal;
use xf_hal::{pages_for, Port, PAGE_SIZE};

use crate::protocol::{Cookie, DbufCreate, DisplEvent, DisplLayout, DisplRequest, DisplResponse, Operation};

struct Rig {
    responder: ControlResponder<DisplRequest, DisplResponse>,
    req_port: Port,
    events: EventRing<DisplLayout>,
    evt_port: Port,
}

struct Connector {
    path: String,
    rig: Option<Rig>,
    requests: Vec<DisplRequest>,
}

pub struct DisplayBackend {
    hal: Weak<MockHal>,
    grants: Arc<GrantTable>,
    store: Arc<MockStore>,
    connectors: Mutex<Vec<Connector>>,
    failing: Mutex<Option<(Operation, i32)>>,
    flip_events: AtomicBool,
}

impl DisplayBackend {
    /// Serve connector 0 of each frontend node in `nodes`.
    pub fn install(
        hal: &Arc<MockHal>,
        grants: &Arc<GrantTable>,
        store: &Arc<MockStore>,
        nodes: &[&str],
    ) -> Arc<Self> {
        let backend = Arc::new(Self {
            hal: Arc::downgrade(hal),
            grants: grants.clone(),
            store: store.clone(),
            connectors: Mutex::new(
                nodes
                    .iter()
                    .map(|node| Connector {
                        path: format!("{node}/0"),
                        rig: None,
                        requests: Vec::new(),
                    })
                    .collect(),
            ),
            failing: Mutex::new(None),
            flip_events: AtomicBool::new(true),
        });
        let hook = Arc::downgrade(&backend);
        hal.set_remote(move |port| {
            if let Some(backend) = hook.upgrade() {
                backend.on_notify(port);
            }
        });
        backend
    }

    fn connectors(&self) -> MutexGuard<'_, Vec<Connector>> {
        self.connectors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `op` with `status` from now on.
    pub fn fail(&self, op: Operation, status: i32) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = Some((op, status));
    }

    pub fn set_flip_events(&self, on: bool) {
        self.flip_events.store(on, Ordering::SeqCst);
    }

    /// Requests seen by connector `i`, in order.
    pub fn requests(&self, i: usize) -> Vec<DisplRequest> {
        self.connectors()[i].requests.clone()
    }

    pub fn operations(&self, i: usize) -> Vec<u8> {
        self.requests(i).iter().map(|r| r.operation).collect()
    }

    fn attach(&self, hal: &MockHal, path: &str) -> Option<Rig> {
        let key = |k: &str| -> Option<u32> { self.store.get(&format!("{path}/{k}"))?.parse().ok() };
        let req_ref = GrantRef(key("req-ring-ref")?);
        let evt_ref = GrantRef(key("evt-ring-ref")?);
        // SAFETY: the frontend keeps its ring pages alive until it closes the ports
        let responder = unsafe { ControlResponder::map(hal, &self.grants, req_ref)? };
        let page = NonNull::new(hal.frame_ptr(self.grants.frame_of(evt_ref))?)?;
        // SAFETY: as above
        let events = unsafe { EventRing::new(page) };
        Some(Rig {
            responder,
            req_port: key("req-event-channel")?,
            events,
            evt_port: key("evt-event-channel")?,
        })
    }

    fn on_notify(&self, port: Port) {
        let Some(hal) = self.hal.upgrade() else { return };
        let failing = *self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        let mut connectors = self.connectors();
        for c in connectors.iter_mut() {
            if c.rig.is_none() {
                c.rig = self.attach(&hal, &c.path);
            }
            let Some(rig) = c.rig.as_ref() else { continue };
            if rig.req_port != port {
                continue;
            }

            let requests = &mut c.requests;
            let mut flipped = Vec::new();
            rig.responder.service(&hal, port, |req| {
                requests.push(*req);
                if req.operation == Operation::PgFlip as u8 {
                    flipped.push((req.id, req.payload::<Cookie>().cookie));
                }
                let status = match failing {
                    Some((op, status)) if op as u8 == req.operation => status,
                    _ => 0,
                };
                DisplResponse::reply(req, status)
            });

            if self.flip_events.load(Ordering::SeqCst) && !flipped.is_empty() {
                for (id, cookie) in flipped {
                    rig.events.produce(&DisplEvent::page_flip(id, cookie));
                }
                hal.raise(rig.evt_port);
            }
        }
    }

    /// Contents of the buffer announced by connector `i`'s DBUF_CREATE,
    /// read through its grant directory.
    pub fn device_buffer(&self, i: usize) -> Option<Vec<u8>> {
        let hal = self.hal.upgrade()?;
        let create: DbufCreate = self
            .requests(i)
            .iter()
            .find(|r| r.operation == Operation::DbufCreate as u8)?
            .payload();
        let mut left = pages_for(create.buffer_sz as usize);
        let mut dir = create.gref_directory;
        let mut out = Vec::with_capacity(left * PAGE_SIZE);
        while left > 0 && dir != 0 {
            let page = hal.frame_ptr(self.grants.frame_of(GrantRef(dir)))?;
            // SAFETY: directory pages stay granted while the frontend is alive
            let page = unsafe { core::slice::from_raw_parts(page, PAGE_SIZE) };
            let (next, grefs) = parse_directory_page(page);
            for gref in grefs.take(left) {
                let data = hal.frame_ptr(self.grants.frame_of(GrantRef(gref)))?;
                // SAFETY: as above
                out.extend_from_slice(unsafe { core::slice::from_raw_parts(data, PAGE_SIZE) });
                left -= 1;
            }
            dir = next;
        }
        out.truncate(create.buffer_sz as usize);
        Some(out)
    }
}
