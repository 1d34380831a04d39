//! Process-wide serial to device context cache.

use {
    crate::{adapter::Backend, context::DeviceContext, relay::RelayConfig, utils::Result},
    log::info,
    std::{
        collections::HashMap,
        sync::{Arc, PoisonError, RwLock},
    },
    tokio::sync::Mutex,
};

/// Owns every device context the broker has seen.
///
/// Entries are created by discovery sweeps and live as long as the registry.
/// Sessions reach contexts through `Arc` handles and refer back to sessions
/// only by client identity.
pub struct DeviceRegistry {
    backend: Arc<dyn Backend>,
    relay: RelayConfig,
    sweep: Mutex<()>,
    contexts: RwLock<HashMap<String, Arc<DeviceContext>>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn Backend>, relay: RelayConfig) -> DeviceRegistry {
        DeviceRegistry {
            backend,
            relay,
            sweep: Mutex::new(()),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Sweep attached adapters and return the contexts of those found.
    ///
    /// Serials seen by an earlier sweep keep their context. Contexts are
    /// never removed: an adapter missing from this sweep is left out of the
    /// result but stays reachable through [`DeviceRegistry::find`].
    pub async fn find_all(&self) -> Result<Vec<Arc<DeviceContext>>> {
        let _sweep = self.sweep.lock().await;

        let adapters = self.backend.find_all().await?;
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut found = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let serial = adapter.serial().to_owned();
            let context = contexts.entry(serial).or_insert_with_key(|serial| {
                info!("discovered adapter {}", serial);
                Arc::new(DeviceContext::new(adapter, self.relay.clone()))
            });
            found.push(context.clone());
        }

        found.sort_by(|a, b| a.serial().cmp(b.serial()));
        found.dedup_by(|a, b| Arc::ptr_eq(a, b));
        Ok(found)
    }

    /// Look up a serial seen by an earlier sweep.
    pub fn find(&self, serial: &str) -> Option<Arc<DeviceContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
    }

    pub fn contexts(&self) -> Vec<Arc<DeviceContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Stop the relays and lock task of every context.
    pub async fn shutdown(&self) {
        for context in self.contexts() {
            context.shutdown().await;
        }
        info!("device registry shut down");
    }
}
