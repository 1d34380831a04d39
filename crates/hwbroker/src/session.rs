//! Per-connection request dispatch.

use {
    crate::{
        codec::ServerCodec,
        context::DeviceContext,
        error::Error,
        mailbox::MailboxProvider,
        registry::DeviceRegistry,
        rpc::*,
        utils::Result,
    },
    futures::sink::SinkExt,
    log::{debug, error, info, trace},
    std::{
        collections::{BTreeSet, HashMap},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_stream::StreamExt,
    tokio_util::{codec::Framed, sync::CancellationToken},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocator of client identities.
///
/// Identities are `u8`; the lowest free one is handed out and returned to
/// the pool when its lease is dropped.
#[derive(Clone)]
pub struct ClientIds {
    leased: Arc<Mutex<BTreeSet<ClientId>>>,
    limit: usize,
}

impl ClientIds {
    /// At most `max_clients` identities are leased at once; clamped to
    /// `1..=256`.
    pub fn new(max_clients: usize) -> ClientIds {
        ClientIds {
            leased: Arc::new(Mutex::new(BTreeSet::new())),
            limit: max_clients.clamp(1, ClientId::MAX as usize + 1),
        }
    }

    pub fn lease(&self) -> Result<ClientIdLease> {
        let mut leased = lock(&self.leased);
        if leased.len() >= self.limit {
            return Err(Error::NoClientIds);
        }
        let id = (0..=ClientId::MAX)
            .find(|id| !leased.contains(id))
            .ok_or(Error::NoClientIds)?;
        leased.insert(id);
        Ok(ClientIdLease {
            id,
            leased: self.leased.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        lock(&self.leased).len()
    }
}

/// A leased client identity.
pub struct ClientIdLease {
    id: ClientId,
    leased: Arc<Mutex<BTreeSet<ClientId>>>,
}

impl ClientIdLease {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for ClientIdLease {
    fn drop(&mut self) {
        lock(&self.leased).remove(&self.id);
    }
}

/// State of one client connection.
///
/// Everything the connection acquired on a device context is released
/// when [`Session::run`] returns, however the connection ended.
pub struct Session {
    lease: ClientIdLease,
    registry: Arc<DeviceRegistry>,
    mailboxes: Arc<dyn MailboxProvider>,
    prefix: String,
    stop: CancellationToken,
    /// Bulk channel opened per serial
    channels: HashMap<String, MailboxPair>,
    /// Serials this connection opened, brought online or locked
    touched: BTreeSet<String>,
}

impl Session {
    pub fn new(
        lease: ClientIdLease,
        registry: Arc<DeviceRegistry>,
        mailboxes: Arc<dyn MailboxProvider>,
        prefix: &str,
    ) -> Session {
        Session {
            lease,
            registry,
            mailboxes,
            prefix: prefix.to_owned(),
            stop: CancellationToken::new(),
            channels: HashMap::new(),
            touched: BTreeSet::new(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.lease.id()
    }

    /// Replace the stop signal, e.g. with a child of a server-wide token.
    pub fn with_stop(mut self, stop: CancellationToken) -> Session {
        self.stop = stop;
        self
    }

    /// Cancelling the returned token ends the session and drops its socket.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serve requests on `stream` until it fails, closes or is stopped.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!("client {} connected", self.client());

        let mut framed = Framed::new(stream, ServerCodec);
        let res = self.serve(&mut framed).await;
        drop(framed);

        self.teardown().await;
        info!("client {} disconnected", self.client());
        res
    }

    async fn serve<S>(&mut self, framed: &mut Framed<S, ServerCodec>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                request = framed.next() => match request {
                    Some(request) => request?,
                    None => return Ok(()),
                },
            };
            debug!("\t← client {}: {:?}", self.client(), request);

            let Some(response) = self.handle(request).await else {
                continue;
            };
            trace!("\t→ client {}: {:?}", self.client(), response);
            framed.send(response).await?;
        }
    }

    fn context(&self, serial: &str) -> Result<Arc<DeviceContext>> {
        self.registry
            .find(serial)
            .ok_or_else(|| Error::UnknownSerial(serial.to_owned()))
    }

    fn status(&self, opcode: Opcode, res: Result<()>) -> Response {
        if let Err(e) = &res {
            error!("client {}: {:?} failed: {}", self.client(), opcode, e);
        }
        Response::Status(res.is_ok())
    }

    /// Execute one request. Returns `None` for requests without a response.
    async fn handle(&mut self, request: Request) -> Option<Response> {
        use crate::Request::*;

        let opcode = Opcode::from(&request);
        let client = self.client();
        let backend = self.registry.backend().clone();

        let response = match request {
            GetSupportedDevices => Response::SupportedDevices(backend.supported_devices()),
            FindAll => match self.registry.find_all().await {
                Ok(contexts) => {
                    Response::Serials(contexts.iter().map(|c| Serial::new(c.serial())).collect())
                }
                Err(e) => {
                    error!("client {}: discovery failed: {}", client, e);
                    Response::Serials(Vec::new())
                }
            },
            MailboxOpen { serial } => match self.open_channel(&serial).await {
                Ok(pair) => Response::MailboxOpened(Some(pair)),
                Err(e) => {
                    error!("client {}: opening channel for {} failed: {}", client, serial, e);
                    Response::MailboxOpened(None)
                }
            },
            MailboxClose { serial } => {
                let res = self.close_channel(&serial).await;
                self.status(opcode, res)
            }
            DeviceOpen { serial } => {
                let res = self
                    .on_context(&serial, |ctx| async move { ctx.open(client).await })
                    .await;
                self.status(opcode, res)
            }
            DeviceClose { serial } => {
                let res = self
                    .on_context(&serial, |ctx| async move { ctx.close(client).await })
                    .await;
                self.status(opcode, res)
            }
            DeviceGoOnline { serial } => {
                let res = self
                    .on_context(&serial, |ctx| async move { ctx.go_online(client).await })
                    .await;
                self.status(opcode, res)
            }
            DeviceGoOffline { serial } => {
                let res = self
                    .on_context(&serial, |ctx| async move { ctx.go_offline(client).await })
                    .await;
                self.status(opcode, res)
            }
            DeviceLock {
                serial,
                max_duration_ms,
            } => {
                let res = self.lock_device(&serial, max_duration_ms).await;
                self.status(opcode, res)
            }
            DeviceUnlock { serial } => {
                let res = self.context(&serial).map(|ctx| {
                    if !ctx.unlock(client) {
                        debug!("client {}: {} was not locked", client, serial);
                    }
                });
                self.status(opcode, res)
            }
            GetEvents => Response::Events(backend.events()),
            GetLastError => Response::LastError(backend.last_error()),
            GetEventCount { filter } => Response::Count(backend.event_count(&filter)),
            DiscardEvents { filter } => {
                backend.discard_events(&filter);
                return None;
            }
            GetEventLimit => Response::Count(backend.event_limit()),
            SetEventLimit { limit } => {
                backend.set_event_limit(limit);
                return None;
            }
        };

        Some(response)
    }

    /// Run a holder operation on the context of `serial`, remembering the
    /// serial for teardown.
    async fn on_context<F, Fut>(&mut self, serial: &str, op: F) -> Result<()>
    where
        F: FnOnce(Arc<DeviceContext>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ctx = self.context(serial)?;
        self.touched.insert(serial.to_owned());
        op(ctx).await
    }

    async fn lock_device(&mut self, serial: &str, max_duration_ms: i64) -> Result<()> {
        let ctx = self.context(serial)?;
        self.touched.insert(serial.to_owned());

        let duration = Duration::from_millis(max_duration_ms.max(0) as u64);
        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::LockStopped),
            res = ctx.lock(self.client(), duration) => res,
        }
    }

    async fn open_channel(&mut self, serial: &str) -> Result<MailboxPair> {
        if self.channels.contains_key(serial) {
            return Err(Error::DuplicateChannel(serial.to_owned()));
        }
        let ctx = self.context(serial)?;
        let pair = MailboxPair::derive(&self.prefix, serial, self.client());

        let writer = self.mailboxes.open(&pair.writer, true).await?;
        let reader = match self.mailboxes.open(&pair.reader, true).await {
            Ok(reader) => reader,
            Err(e) => {
                writer.close();
                return Err(e);
            }
        };

        if let Err(e) = ctx.add_writer(writer.clone()).await {
            writer.close();
            reader.close();
            return Err(e);
        }
        if let Err(e) = ctx.add_reader(reader.clone()).await {
            if let Err(e) = ctx.remove_writer(&pair.writer).await {
                error!("rolling back writer {}: {}", pair.writer, e);
            }
            reader.close();
            return Err(e);
        }

        info!(
            "client {}: channel for {} open ({} / {})",
            self.client(),
            serial,
            pair.writer,
            pair.reader
        );
        self.channels.insert(serial.to_owned(), pair.clone());
        Ok(pair)
    }

    async fn close_channel(&mut self, serial: &str) -> Result<()> {
        let pair = self
            .channels
            .remove(serial)
            .ok_or_else(|| Error::NoChannel(serial.to_owned()))?;
        let ctx = self.context(serial)?;

        let writer = ctx.remove_writer(&pair.writer).await;
        let reader = ctx.remove_reader(&pair.reader).await;
        writer.and(reader)
    }

    async fn teardown(&mut self) {
        let client = self.client();

        let serials: Vec<String> = self.channels.keys().cloned().collect();
        for serial in serials {
            if let Err(e) = self.close_channel(&serial).await {
                error!("client {}: closing channel for {}: {}", client, serial, e);
            }
        }

        for serial in std::mem::take(&mut self.touched) {
            if let Some(ctx) = self.registry.find(&serial) {
                ctx.release_client(client).await;
            }
        }
    }
}
