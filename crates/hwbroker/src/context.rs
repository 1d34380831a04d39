//! Per-adapter coordination state.

use {
    crate::{
        adapter::Adapter,
        error::Error,
        mailbox::Mailbox,
        relay::{ReaderRelay, RelayConfig, WriterRelay},
        rpc::ClientId,
        timed_lock::TimedLock,
        utils::Result,
    },
    log::{error, info},
    std::{
        collections::{BTreeSet, HashMap},
        sync::Arc,
        time::Duration,
    },
    tokio::sync::Mutex,
};

#[derive(Default)]
struct ContextState {
    open_holders: BTreeSet<ClientId>,
    online_holders: BTreeSet<ClientId>,
    readers: HashMap<String, ReaderRelay>,
    writers: HashMap<String, WriterRelay>,
}

/// Shared state of one adapter.
///
/// The adapter is physically opened when the first client opens it and
/// closed when the last one closes it; online/offline follow the same rule.
/// Holder sets and both registration maps sit behind one mutex, so none of
/// these operations interleave. The timed lock is synchronised on its own.
pub struct DeviceContext {
    adapter: Arc<dyn Adapter>,
    relay: RelayConfig,
    state: Mutex<ContextState>,
    lock: TimedLock,
}

impl DeviceContext {
    pub fn new(adapter: Arc<dyn Adapter>, relay: RelayConfig) -> DeviceContext {
        DeviceContext {
            adapter,
            relay,
            state: Mutex::new(ContextState::default()),
            lock: TimedLock::new(),
        }
    }

    pub fn serial(&self) -> &str {
        self.adapter.serial()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub async fn open(&self, client: ClientId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.open_holders.insert(client) {
            return Err(Error::AlreadyOpen(client));
        }
        if state.open_holders.len() > 1 {
            return Ok(());
        }

        self.adapter.set_disabled_by_default(true);
        if let Err(e) = self.adapter.open().await {
            state.open_holders.remove(&client);
            return Err(e);
        }
        info!("{} opened for client {}", self.serial(), client);
        Ok(())
    }

    pub async fn close(&self, client: ClientId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.open_holders.remove(&client) {
            return Err(Error::NotOpen(client));
        }
        if !state.open_holders.is_empty() {
            return Ok(());
        }

        info!("{} closing, last holder was client {}", self.serial(), client);
        self.adapter.close().await
    }

    pub async fn go_online(&self, client: ClientId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.online_holders.insert(client) {
            return Err(Error::AlreadyOnline(client));
        }
        if state.online_holders.len() > 1 {
            return Ok(());
        }

        if let Err(e) = self.adapter.go_online().await {
            state.online_holders.remove(&client);
            return Err(e);
        }
        info!("{} online for client {}", self.serial(), client);
        Ok(())
    }

    pub async fn go_offline(&self, client: ClientId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.online_holders.remove(&client) {
            return Err(Error::NotOnline(client));
        }
        if !state.online_holders.is_empty() {
            return Ok(());
        }

        info!("{} going offline, last holder was client {}", self.serial(), client);
        self.adapter.go_offline().await
    }

    /// Relay every raw buffer the adapter produces into `mailbox`.
    pub async fn add_reader(&self, mailbox: Arc<dyn Mailbox>) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = mailbox.id().to_owned();
        if state.readers.contains_key(&id) {
            return Err(Error::DuplicateRegistration(id));
        }

        let relay = ReaderRelay::spawn(&*self.adapter, mailbox, self.relay.clone());
        state.readers.insert(id, relay);
        Ok(())
    }

    /// Stop relaying into the mailbox named `id`.
    ///
    /// Waits for a chunked write already in progress to finish.
    pub async fn remove_reader(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let relay = state
            .readers
            .remove(id)
            .ok_or_else(|| Error::NotRegistered(id.to_owned()))?;
        relay.stop(&*self.adapter).await;
        Ok(())
    }

    /// Relay messages written into `mailbox` to the adapter.
    pub async fn add_writer(&self, mailbox: Arc<dyn Mailbox>) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = mailbox.id().to_owned();
        if state.writers.contains_key(&id) {
            return Err(Error::DuplicateRegistration(id));
        }

        let relay = WriterRelay::spawn(self.adapter.clone(), mailbox, self.relay.clone());
        state.writers.insert(id, relay);
        Ok(())
    }

    /// Stop and join the relay task of the mailbox named `id`.
    pub async fn remove_writer(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let relay = state
            .writers
            .remove(id)
            .ok_or_else(|| Error::NotRegistered(id.to_owned()))?;
        relay.stop().await;
        Ok(())
    }

    /// Acquire the device lock, holding it for at most `max_duration`.
    pub async fn lock(&self, client: ClientId, max_duration: Duration) -> Result<()> {
        self.lock.lock(client, max_duration).await
    }

    /// Release the device lock regardless of which client holds it.
    pub fn unlock(&self, client: ClientId) -> bool {
        let held_by = self.lock.holder();
        let released = self.lock.unlock();
        if released && held_by != Some(client) {
            info!(
                "{} lock of client {:?} released by client {}",
                self.serial(),
                held_by,
                client
            );
        }
        released
    }

    pub fn lock_holder(&self) -> Option<ClientId> {
        self.lock.holder()
    }

    /// Drop every holder entry `client` still has on this device.
    ///
    /// Used when a connection ends without closing what it opened.
    pub async fn release_client(&self, client: ClientId) {
        self.lock.release_if_held_by(client);

        let (was_online, was_open) = {
            let state = self.state.lock().await;
            (
                state.online_holders.contains(&client),
                state.open_holders.contains(&client),
            )
        };
        if was_online {
            if let Err(e) = self.go_offline(client).await {
                error!("{}: releasing online state of client {}: {}", self.serial(), client, e);
            }
        }
        if was_open {
            if let Err(e) = self.close(client).await {
                error!("{}: releasing open state of client {}: {}", self.serial(), client, e);
            }
        }
    }

    pub async fn open_holders(&self) -> Vec<ClientId> {
        self.state.lock().await.open_holders.iter().copied().collect()
    }

    pub async fn online_holders(&self) -> Vec<ClientId> {
        self.state.lock().await.online_holders.iter().copied().collect()
    }

    pub async fn registrations(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.readers.len(), state.writers.len())
    }

    /// Stop every relay and the lock task.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, relay) in state.readers.drain() {
            relay.stop(&*self.adapter).await;
        }
        for (_, relay) in state.writers.drain() {
            relay.stop().await;
        }
        drop(state);
        self.lock.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            loopback::LoopbackAdapter,
            mailbox::{LocalMailboxes, MailboxProvider},
        },
    };

    fn context() -> (Arc<LoopbackAdapter>, DeviceContext) {
        let adapter = Arc::new(LoopbackAdapter::new("A"));
        let ctx = DeviceContext::new(adapter.clone(), RelayConfig::default());
        (adapter, ctx)
    }

    #[tokio::test]
    async fn opened_once_closed_once() {
        for holders in 1..=4u8 {
            let (adapter, ctx) = context();
            for client in 0..holders {
                ctx.open(client).await.unwrap();
            }
            assert_eq!(adapter.stats().opens, 1);
            assert!(adapter.stats().disabled_by_default);

            for client in 0..holders {
                assert_eq!(adapter.stats().closes, 0);
                ctx.close(client).await.unwrap();
            }
            let stats = adapter.stats();
            assert_eq!((stats.opens, stats.closes), (1, 1));
            assert!(!stats.is_open);
        }
    }

    #[tokio::test]
    async fn double_open_and_stray_close_fail() {
        let (adapter, ctx) = context();
        ctx.open(1).await.unwrap();
        assert!(matches!(ctx.open(1).await, Err(Error::AlreadyOpen(1))));
        assert!(matches!(ctx.close(2).await, Err(Error::NotOpen(2))));
        assert_eq!(ctx.open_holders().await, vec![1]);
        assert_eq!(adapter.stats().opens, 1);
        assert!(adapter.stats().is_open);
    }

    #[tokio::test]
    async fn failed_physical_open_rolls_back() {
        let (adapter, ctx) = context();
        adapter.set_fail_open(true);
        assert!(matches!(ctx.open(1).await, Err(Error::Adapter(_))));
        assert!(ctx.open_holders().await.is_empty());

        adapter.set_fail_open(false);
        ctx.open(1).await.unwrap();
        assert_eq!(adapter.stats().opens, 1);
    }

    #[tokio::test]
    async fn online_is_reference_counted() {
        let (adapter, ctx) = context();
        ctx.open(1).await.unwrap();
        ctx.go_online(1).await.unwrap();
        ctx.go_online(2).await.unwrap();
        assert!(matches!(ctx.go_online(2).await, Err(Error::AlreadyOnline(2))));
        assert_eq!(adapter.stats().onlines, 1);

        ctx.go_offline(1).await.unwrap();
        assert_eq!(adapter.stats().offlines, 0);
        ctx.go_offline(2).await.unwrap();
        assert_eq!(adapter.stats().offlines, 1);
        assert!(matches!(ctx.go_offline(2).await, Err(Error::NotOnline(2))));
    }

    #[tokio::test]
    async fn reader_registration_is_exclusive() {
        let (adapter, ctx) = context();
        let hub = LocalMailboxes::new(16, 8);
        let mb = hub.open("r", true).await.unwrap();

        ctx.add_reader(mb.clone()).await.unwrap();
        assert!(matches!(
            ctx.add_reader(mb.clone()).await,
            Err(Error::DuplicateRegistration(_))
        ));
        assert_eq!(adapter.callback_count(), 1);
        assert_eq!(ctx.registrations().await, (1, 0));

        assert!(matches!(
            ctx.remove_reader("other").await,
            Err(Error::NotRegistered(_))
        ));
        assert_eq!(ctx.registrations().await, (1, 0));

        ctx.remove_reader("r").await.unwrap();
        assert_eq!(adapter.callback_count(), 0);
        assert!(matches!(
            ctx.remove_reader("r").await,
            Err(Error::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn writer_registration_is_exclusive() {
        let (_adapter, ctx) = context();
        let hub = LocalMailboxes::new(16, 8);
        let mb = hub.open("w", true).await.unwrap();

        ctx.add_writer(mb.clone()).await.unwrap();
        assert!(matches!(
            ctx.add_writer(mb).await,
            Err(Error::DuplicateRegistration(_))
        ));
        ctx.remove_writer("w").await.unwrap();
        assert!(matches!(
            ctx.remove_writer("w").await,
            Err(Error::NotRegistered(_))
        ));
        assert_eq!(ctx.registrations().await, (0, 0));
    }

    #[tokio::test]
    async fn release_client_drops_all_entries() {
        let (adapter, ctx) = context();
        ctx.open(1).await.unwrap();
        ctx.open(2).await.unwrap();
        ctx.go_online(1).await.unwrap();
        ctx.lock(1, Duration::from_secs(60)).await.unwrap();

        ctx.release_client(1).await;
        assert_eq!(ctx.open_holders().await, vec![2]);
        assert!(ctx.online_holders().await.is_empty());
        assert_eq!(ctx.lock_holder(), None);
        assert!(adapter.stats().is_open);
        assert!(!adapter.stats().is_online);

        ctx.release_client(2).await;
        assert!(!adapter.stats().is_open);
    }

    #[tokio::test]
    async fn anyone_may_unlock() {
        let (_adapter, ctx) = context();
        ctx.lock(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(ctx.lock_holder(), Some(1));
        assert!(ctx.unlock(2));
        assert_eq!(ctx.lock_holder(), None);
        assert!(!ctx.unlock(2));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_reader_waits_for_chunked_write() {
        let (adapter, ctx) = context();
        let ctx = Arc::new(ctx);
        let hub = LocalMailboxes::new(8, 1);
        let server_side = hub.open("r", true).await.unwrap();
        let client_side = hub.connect("r").unwrap();
        ctx.add_reader(server_side).await.unwrap();

        // Six frames through a mailbox that holds one
        let data: Vec<u8> = (0..8 * 3 + 17).map(|i| i as u8).collect();
        adapter.deliver(&data);
        let first = client_side.read(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.length as usize, data.len());
        let mut received = first.payload.to_vec();

        let remove = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.remove_reader("r").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!remove.is_finished());

        for _ in 0..4 {
            let frame = client_side.read(Duration::from_secs(1)).await.unwrap().unwrap();
            received.extend_from_slice(&frame.payload);
        }
        remove.await.unwrap().unwrap();

        // The last frame went in before the mailbox was closed
        assert_eq!(&received[..], &data[..40]);
        assert_eq!(client_side.pending(), 1);
        assert!(client_side.is_closed());
        assert_eq!(adapter.callback_count(), 0);
        assert_eq!(ctx.registrations().await, (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_reader_waits_for_exhausted_retries() {
        let adapter = Arc::new(LoopbackAdapter::new("A"));
        let relay = RelayConfig {
            write_attempts: 3,
            ..Default::default()
        };
        let ctx = DeviceContext::new(adapter.clone(), relay.clone());
        let hub = LocalMailboxes::new(8, 1);
        let server_side = hub.open("r", true).await.unwrap();
        let client_side = hub.connect("r").unwrap();
        ctx.add_reader(server_side).await.unwrap();

        adapter.deliver(&[7u8; 8 * 3 + 17]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client_side.pending(), 1);

        let started = tokio::time::Instant::now();
        ctx.remove_reader("r").await.unwrap();
        assert!(started.elapsed() >= relay.write_timeout);

        // Only the first frame made it, and the client can no longer read it
        assert_eq!(client_side.pending(), 1);
        assert!(matches!(
            client_side.read(Duration::from_millis(1)).await,
            Err(Error::MailboxClosed(_))
        ));
    }
}
