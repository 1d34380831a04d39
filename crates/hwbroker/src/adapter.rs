//! Seams to the hardware adapter library.
//!
//! The broker never talks to hardware itself. Discovery, the physical
//! open/online transitions, raw writes and raw-data delivery are provided by
//! an implementation of [`Backend`] and [`Adapter`].

use {
    crate::{
        rpc::{DeviceType, Event, EventFilter},
        utils::Result,
    },
    async_trait::async_trait,
    bytes::Bytes,
    std::sync::Arc,
};

/// Callback invoked with every raw buffer the adapter produces.
///
/// It runs on whatever thread the adapter library delivers data on and must
/// not block.
pub type RawCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Handle returned by [`Adapter::add_raw_callback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

/// One physical communication adapter.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Serial uniquely identifying this adapter.
    fn serial(&self) -> &str;

    /// Apply the passive, disabled-by-default configuration.
    ///
    /// Called before the first physical open so a shared adapter starts
    /// without any network enabled.
    fn set_disabled_by_default(&self, disabled: bool);

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn go_online(&self) -> Result<()>;

    async fn go_offline(&self) -> Result<()>;

    /// Send a raw buffer to the adapter.
    async fn raw_write(&self, data: Bytes) -> Result<()>;

    fn add_raw_callback(&self, callback: RawCallback) -> CallbackId;

    /// Returns `false` if `id` was not registered.
    fn remove_raw_callback(&self, id: CallbackId) -> bool;
}

/// Adapter library entry point: discovery plus the event subsystem.
///
/// Event methods are pure pass-through queries. The defaults describe a
/// library without an event subsystem.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Catalog of device types the library supports.
    fn supported_devices(&self) -> Vec<DeviceType>;

    /// Sweep attached hardware and return every adapter currently present.
    async fn find_all(&self) -> Result<Vec<Arc<dyn Adapter>>>;

    fn events(&self) -> Vec<Event> {
        Vec::new()
    }

    fn last_error(&self) -> Event {
        Event::default()
    }

    fn event_count(&self, _filter: &EventFilter) -> u64 {
        0
    }

    fn discard_events(&self, _filter: &EventFilter) {}

    fn event_limit(&self) -> u64 {
        0
    }

    fn set_event_limit(&self, _limit: u64) {}
}
