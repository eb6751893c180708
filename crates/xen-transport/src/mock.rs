//! Backend stand-ins for host tests: an in-memory store and the back end of
//! a control ring.

extern crate std;

use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

use core::ptr::NonNull;

use xf_hal::mock::MockHal;
use xf_hal::{Port, PAGE_SIZE};

use crate::call::{ControlRequest, ControlResponse};
use crate::grant::{GrantRef, GrantTable};
use crate::ring::BackRing;
use crate::xenbus::XenStore;
use crate::XenbusError;

#[derive(Default)]
struct StoreState {
    entries: BTreeMap<String, String>,
    writes: Vec<(String, String)>,
    followers: Vec<(String, String)>,
}

/// In-memory xenstore.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a key without recording it as a frontend write.
    pub fn set(&self, path: &str, value: &str) {
        self.state().entries.insert(path.to_string(), value.to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.state().entries.get(path).cloned()
    }

    /// Every `write` issued through the `XenStore` interface, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.state().writes.clone()
    }

    /// Make the backend at `backend` mirror the frontend at `frontend`:
    /// Initialised is answered with Connected, Closing and Closed are echoed.
    pub fn follow_frontend(&self, frontend: &str, backend: &str) {
        self.state()
            .followers
            .push((std::format!("{frontend}/state"), std::format!("{backend}/state")));
    }
}

impl XenStore for MockStore {
    fn read(&self, path: &str) -> Result<String, XenbusError> {
        self.get(path).ok_or(XenbusError::Missing)
    }

    fn write(&self, path: &str, value: &str) -> Result<(), XenbusError> {
        let mut state = self.state();
        state.entries.insert(path.to_string(), value.to_string());
        state.writes.push((path.to_string(), value.to_string()));

        let answer = match value {
            "3" => Some("4"),
            "5" => Some("5"),
            "6" => Some("6"),
            _ => None,
        };
        if let Some(answer) = answer {
            let targets: Vec<String> = state
                .followers
                .iter()
                .filter(|(front, _)| front == path)
                .map(|(_, back)| back.clone())
                .collect();
            for back in targets {
                state.entries.insert(back, answer.to_string());
            }
        }
        Ok(())
    }

    fn directory(&self, path: &str) -> Result<Vec<String>, XenbusError> {
        let prefix = std::format!("{path}/");
        let state = self.state();
        let mut children: Vec<String> = state
            .entries
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(ToString::to_string)
            .collect();
        children.dedup();
        if children.is_empty() {
            return Err(XenbusError::Missing);
        }
        Ok(children)
    }
}

/// Back end of a control ring, answering requests with a closure.
pub struct ControlResponder<Req, Rsp> {
    ring: Mutex<BackRing<Req, Rsp>>,
}

impl<Req: ControlRequest, Rsp: ControlResponse> ControlResponder<Req, Rsp> {
    /// # Safety
    ///
    /// `page` must be an initialized front ring page that outlives the responder.
    pub unsafe fn attach(page: NonNull<u8>) -> Self {
        Self {
            ring: Mutex::new(BackRing::attach(page, PAGE_SIZE)),
        }
    }

    /// Map the ring page the frontend granted as `gref`.
    ///
    /// # Safety
    ///
    /// `gref` must grant an initialized front ring page that outlives the responder.
    pub unsafe fn map(hal: &MockHal, grants: &GrantTable, gref: GrantRef) -> Option<Self> {
        let ptr = hal.frame_ptr(grants.frame_of(gref))?;
        Some(Self::attach(NonNull::new(ptr)?))
    }

    fn ring(&self) -> MutexGuard<'_, BackRing<Req, Rsp>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every pending request, then notify the frontend on `port` if it
    /// asked for it. Returns the number of requests handled.
    pub fn service(&self, hal: &MockHal, port: Port, mut answer: impl FnMut(&Req) -> Rsp) -> usize {
        let mut handled = 0;
        let notify = {
            let mut ring = self.ring();
            loop {
                while let Some(req) = ring.take_request() {
                    let rsp = answer(&req);
                    ring.push_response(&rsp);
                    handled += 1;
                }
                if !ring.final_check_for_requests() {
                    break;
                }
            }
            handled > 0 && ring.push_responses_and_check_notify()
        };
        if notify {
            hal.raise(port);
        }
        handled
    }

    /// Publish a response no request asked for.
    pub fn push_unsolicited(&self, rsp: &Rsp) {
        let mut ring = self.ring();
        ring.push_response(rsp);
        ring.push_responses_and_check_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lists_children_once() {
        let store = MockStore::new();
        store.set("device/vdispl/0/backend-id", "0");
        store.set("device/vdispl/0/0/resolution", "640x480");
        store.set("device/vdispl/1/backend-id", "0");
        assert_eq!(store.directory("device/vdispl").unwrap(), ["0", "1"]);
        assert_eq!(store.directory("device/vkbd"), Err(XenbusError::Missing));
    }

    #[test]
    fn test_follow_frontend() {
        let store = MockStore::new();
        store.follow_frontend("device/vkbd/0", "backend/vkbd/0/0");
        store.write("device/vkbd/0/state", "3").unwrap();
        assert_eq!(store.get("backend/vkbd/0/0/state").as_deref(), Some("4"));
        store.write("device/vkbd/0/state", "5").unwrap();
        assert_eq!(store.get("backend/vkbd/0/0/state").as_deref(), Some("5"));
        store.write("device/vkbd/0/other", "6").unwrap();
        assert_eq!(store.get("backend/vkbd/0/0/state").as_deref(), Some("5"));
    }
}
