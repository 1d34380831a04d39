//! Loopback adapters.
//!
//! A backend of virtual adapters living in the broker's own process. Raw
//! writes are recorded and, when echo is enabled, delivered straight back
//! through the raw callbacks. Every physical transition is counted, which
//! makes the backend handy both for trying the daemon without hardware and
//! for tests.

use {
    crate::{
        adapter::{Adapter, Backend, CallbackId, RawCallback},
        error::Error,
        rpc::{DeviceType, Event, EventFilter},
        utils::Result,
    },
    async_trait::async_trait,
    bytes::Bytes,
    log::{debug, info},
    std::{
        collections::{BTreeMap, VecDeque},
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tokio::sync::Notify,
};

/// Device type the loopback backend reports in its catalog.
pub const LOOPBACK_DEVICE_TYPE: DeviceType = 0x4c42;

/// Severity at or above which an event counts as an error.
pub const SEVERITY_ERROR: u8 = 0x30;

/// Events retained before the oldest are dropped.
pub const DEFAULT_EVENT_LIMIT: u64 = 10_000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Physical transitions observed by a [`LoopbackAdapter`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub opens: u32,
    pub closes: u32,
    pub onlines: u32,
    pub offlines: u32,
    pub is_open: bool,
    pub is_online: bool,
    pub disabled_by_default: bool,
}

type SharedCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct LoopbackAdapter {
    serial: String,
    echo: AtomicBool,
    fail_open: AtomicBool,
    stats: Mutex<AdapterStats>,
    callbacks: Mutex<BTreeMap<CallbackId, SharedCallback>>,
    next_callback: AtomicU64,
    written: Mutex<Vec<Bytes>>,
    write_notify: Notify,
}

impl LoopbackAdapter {
    pub fn new(serial: &str) -> LoopbackAdapter {
        LoopbackAdapter {
            serial: serial.to_owned(),
            echo: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            stats: Mutex::new(AdapterStats::default()),
            callbacks: Mutex::new(BTreeMap::new()),
            next_callback: AtomicU64::new(0),
            written: Mutex::new(Vec::new()),
            write_notify: Notify::new(),
        }
    }

    /// Deliver every raw write back through the raw callbacks.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// Make the next physical opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> AdapterStats {
        lock(&self.stats).clone()
    }

    pub fn callback_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Buffers passed to `raw_write` so far.
    pub fn raw_writes(&self) -> Vec<Bytes> {
        lock(&self.written).clone()
    }

    /// Wait up to five seconds for at least `count` raw writes.
    pub async fn wait_for_raw_writes(&self, count: usize) -> Vec<Bytes> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let notified = self.write_notify.notified();
            let written = self.raw_writes();
            if written.len() >= count {
                return written;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.raw_writes();
            }
        }
    }

    /// Push `data` through every registered raw callback, as the adapter's
    /// receive path would.
    pub fn deliver(&self, data: &[u8]) {
        let callbacks: Vec<SharedCallback> = lock(&self.callbacks).values().cloned().collect();
        for callback in callbacks {
            callback(data);
        }
    }
}

#[async_trait]
impl Adapter for LoopbackAdapter {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn set_disabled_by_default(&self, disabled: bool) {
        lock(&self.stats).disabled_by_default = disabled;
    }

    async fn open(&self) -> Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Adapter(format!("{}: open failed", self.serial)));
        }
        let mut stats = lock(&self.stats);
        if stats.is_open {
            return Err(Error::Adapter(format!("{}: already open", self.serial)));
        }
        stats.is_open = true;
        stats.opens += 1;
        info!("loopback {} opened", self.serial);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut stats = lock(&self.stats);
        if !stats.is_open {
            return Err(Error::Adapter(format!("{}: not open", self.serial)));
        }
        stats.is_open = false;
        stats.is_online = false;
        stats.closes += 1;
        info!("loopback {} closed", self.serial);
        Ok(())
    }

    async fn go_online(&self) -> Result<()> {
        let mut stats = lock(&self.stats);
        if !stats.is_open {
            return Err(Error::Adapter(format!("{}: not open", self.serial)));
        }
        if stats.is_online {
            return Err(Error::Adapter(format!("{}: already online", self.serial)));
        }
        stats.is_online = true;
        stats.onlines += 1;
        Ok(())
    }

    async fn go_offline(&self) -> Result<()> {
        let mut stats = lock(&self.stats);
        if !stats.is_online {
            return Err(Error::Adapter(format!("{}: not online", self.serial)));
        }
        stats.is_online = false;
        stats.offlines += 1;
        Ok(())
    }

    async fn raw_write(&self, data: Bytes) -> Result<()> {
        if !lock(&self.stats).is_open {
            return Err(Error::Adapter(format!("{}: not open", self.serial)));
        }
        debug!("loopback {} raw write of {} bytes", self.serial, data.len());
        lock(&self.written).push(data.clone());
        self.write_notify.notify_waiters();
        if self.echo.load(Ordering::SeqCst) {
            self.deliver(&data);
        }
        Ok(())
    }

    fn add_raw_callback(&self, callback: RawCallback) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::SeqCst));
        lock(&self.callbacks).insert(id, Arc::from(callback));
        id
    }

    fn remove_raw_callback(&self, id: CallbackId) -> bool {
        lock(&self.callbacks).remove(&id).is_some()
    }
}

struct EventLog {
    events: VecDeque<Event>,
    last_error: Option<Event>,
    limit: u64,
}

/// Backend whose "attached hardware" is a list of loopback adapters.
pub struct LoopbackBackend {
    adapters: Mutex<Vec<Arc<LoopbackAdapter>>>,
    sweeps: AtomicUsize,
    log: Mutex<EventLog>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        LoopbackBackend {
            adapters: Mutex::new(Vec::new()),
            sweeps: AtomicUsize::new(0),
            log: Mutex::new(EventLog {
                events: VecDeque::new(),
                last_error: None,
                limit: DEFAULT_EVENT_LIMIT,
            }),
        }
    }
}

impl LoopbackBackend {
    pub fn with_serials(serials: &[&str]) -> LoopbackBackend {
        let backend = LoopbackBackend::default();
        for serial in serials {
            backend.attach(Arc::new(LoopbackAdapter::new(serial)));
        }
        backend
    }

    /// Make `adapter` visible to the next discovery sweep.
    pub fn attach(&self, adapter: Arc<LoopbackAdapter>) {
        lock(&self.adapters).push(adapter);
    }

    /// Hide the adapter from subsequent discovery sweeps.
    pub fn detach(&self, serial: &str) {
        lock(&self.adapters).retain(|a| a.serial != serial);
    }

    pub fn adapter(&self, serial: &str) -> Option<Arc<LoopbackAdapter>> {
        lock(&self.adapters)
            .iter()
            .find(|a| a.serial == serial)
            .cloned()
    }

    /// Number of discovery sweeps performed.
    pub fn sweeps(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Record an event in the log, dropping the oldest beyond the limit.
    pub fn push_event(&self, event: Event) {
        let mut log = lock(&self.log);
        if event.severity >= SEVERITY_ERROR {
            log.last_error = Some(event);
        }
        log.events.push_back(event);
        while log.events.len() as u64 > log.limit {
            log.events.pop_front();
        }
    }
}

#[async_trait]
impl Backend for LoopbackBackend {
    fn supported_devices(&self) -> Vec<DeviceType> {
        vec![LOOPBACK_DEVICE_TYPE]
    }

    async fn find_all(&self) -> Result<Vec<Arc<dyn Adapter>>> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.adapters)
            .iter()
            .map(|a| a.clone() as Arc<dyn Adapter>)
            .collect())
    }

    /// Hands out and forgets every queued event.
    fn events(&self) -> Vec<Event> {
        lock(&self.log).events.drain(..).collect()
    }

    fn last_error(&self) -> Event {
        lock(&self.log).last_error.take().unwrap_or_default()
    }

    fn event_count(&self, filter: &EventFilter) -> u64 {
        lock(&self.log)
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .count() as u64
    }

    fn discard_events(&self, filter: &EventFilter) {
        lock(&self.log).events.retain(|e| !filter.matches(e));
    }

    fn event_limit(&self) -> u64 {
        lock(&self.log).limit
    }

    fn set_event_limit(&self, limit: u64) {
        let mut log = lock(&self.log);
        log.limit = limit;
        while log.events.len() as u64 > limit {
            log.events.pop_front();
        }
    }
}
