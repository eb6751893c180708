//! Frontend side of the xenbus handshake.
//!
//! A frontend lives at `device/<class>/<index>` in the store. It publishes its
//! ring references and ports there, then walks the connection state machine in
//! lockstep with the backend found at the path stored under `backend`.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use xf_hal::{DomainId, XenHal};

use crate::XenbusError;

/// `enum xenbus_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum XenbusState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
    Reconfiguring = 7,
    Reconfigured = 8,
}

impl XenbusState {
    pub fn from_raw(value: i64) -> Self {
        match value {
            1 => Self::Initialising,
            2 => Self::InitWait,
            3 => Self::Initialised,
            4 => Self::Connected,
            5 => Self::Closing,
            6 => Self::Closed,
            7 => Self::Reconfiguring,
            8 => Self::Reconfigured,
            _ => Self::Unknown,
        }
    }
}

/// Identity of a discovered frontend: backend domain and index under
/// `device/<class>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub backend: DomainId,
    pub index: u32,
}

/// Key/value configuration store shared with the backend domain.
pub trait XenStore: Send + Sync {
    fn read(&self, path: &str) -> Result<String, XenbusError>;
    fn write(&self, path: &str, value: &str) -> Result<(), XenbusError>;
    /// Names of the immediate children of `path`.
    fn directory(&self, path: &str) -> Result<Vec<String>, XenbusError>;
}

/// Parse an integer the way the store's producers write them: optional sign,
/// then decimal, `0x` hex or leading-zero octal. Trailing text is ignored.
pub fn parse_int(text: &str) -> Option<i64> {
    let s = text.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };
    let end = digits
        .char_indices()
        .find(|&(_, c)| !c.is_digit(radix))
        .map_or(digits.len(), |(i, _)| i);
    if end == 0 {
        // "0" followed by a non-octal digit still parses as zero
        return (radix == 8).then_some(0);
    }
    let value = i64::from_str_radix(&digits[..end], radix).ok()?;
    Some(if negative { -value } else { value })
}

/// Indices of the frontends of `class` (e.g. `vdispl`) present in the store.
pub fn enumerate<S: XenStore + ?Sized>(store: &S, class: &str) -> Vec<u32> {
    let mut found: Vec<u32> = store
        .directory(&format!("device/{class}"))
        .unwrap_or_default()
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();
    found.sort_unstable();
    found
}

/// One frontend node in the store.
pub struct Frontend<S: XenStore + ?Sized> {
    store: Arc<S>,
    node: String,
}

impl<S: XenStore + ?Sized> Frontend<S> {
    pub fn new(store: Arc<S>, class: &str, index: u32) -> Self {
        Self {
            store,
            node: format!("device/{class}/{index}"),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.node, key)
    }

    pub fn read(&self, key: &str) -> Result<String, XenbusError> {
        self.store.read(&self.path(key))
    }

    pub fn read_int(&self, key: &str) -> Result<i64, XenbusError> {
        let text = self.read(key)?;
        parse_int(&text).ok_or(XenbusError::Malformed)
    }

    pub fn write(&self, key: &str, value: &str) -> Result<(), XenbusError> {
        self.store.write(&self.path(key), value)
    }

    pub fn write_int(&self, key: &str, value: impl Into<i64>) -> Result<(), XenbusError> {
        self.write(key, &format!("{}", value.into()))
    }

    pub fn backend_id(&self) -> Result<DomainId, XenbusError> {
        let id = self.read_int("backend-id")?;
        DomainId::try_from(id).map_err(|_| XenbusError::Malformed)
    }

    pub fn backend_path(&self) -> Result<String, XenbusError> {
        self.read("backend")
    }

    /// Backend state; anything unreadable counts as `Unknown`.
    pub fn backend_state(&self) -> XenbusState {
        self.backend_path()
            .and_then(|backend| self.store.read(&format!("{backend}/state")))
            .ok()
            .and_then(|text| parse_int(&text))
            .map_or(XenbusState::Unknown, XenbusState::from_raw)
    }

    pub fn switch_state(&self, state: XenbusState) -> Result<(), XenbusError> {
        log::debug!("[XENBUS] {} -> {:?}", self.node, state);
        self.write_int("state", state as u32)
    }

    /// Poll the backend every `retry_ms` until it reports `state`.
    ///
    /// There is no timeout: an absent backend stalls the caller.
    pub fn wait_for_backend<H: XenHal + ?Sized>(&self, hal: &H, state: XenbusState, retry_ms: u64) {
        loop {
            let current = self.backend_state();
            if current == state {
                return;
            }
            log::debug!("[XENBUS] {}: backend {:?}, waiting for {:?}", self.node, current, state);
            hal.sleep_ms(retry_ms);
        }
    }

    /// Initialised, wait for the backend to connect, then Connected.
    pub fn connect<H: XenHal + ?Sized>(&self, hal: &H, retry_ms: u64) -> Result<(), XenbusError> {
        self.switch_state(XenbusState::Initialised)?;
        hal.yield_to_hypervisor();
        log::info!("[XENBUS] {}: connecting", self.node);
        self.wait_for_backend(hal, XenbusState::Connected, retry_ms);
        self.switch_state(XenbusState::Connected)?;
        log::info!("[XENBUS] {}: connected", self.node);
        Ok(())
    }

    /// Closing and Closed, each acknowledged by the backend.
    pub fn close<H: XenHal + ?Sized>(&self, hal: &H, retry_ms: u64) -> Result<(), XenbusError> {
        for state in [XenbusState::Closing, XenbusState::Closed] {
            self.switch_state(state)?;
            hal.yield_to_hypervisor();
            self.wait_for_backend(hal, state, retry_ms);
        }
        log::info!("[XENBUS] {}: closed", self.node);
        Ok(())
    }
}
