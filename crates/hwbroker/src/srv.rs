//! Accept loop of the broker.
//!
//! # Transport
//! `tcp!host!port` or `unix!path!suffix`. Every accepted connection gets a
//! client identity and runs as its own [`Session`] task.

use {
    crate::{
        io_err,
        mailbox::MailboxProvider,
        registry::DeviceRegistry,
        relay::RelayConfig,
        res,
        rpc::DEFAULT_MAILBOX_PREFIX,
        session::{ClientIds, Session},
        utils::{self, Result},
    },
    log::{error, info, warn},
    std::{
        fmt::Debug,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
};

/// Broker settings shared by every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// First component of every mailbox identity.
    pub mailbox_prefix: String,
    /// Upper bound on concurrent connections; identities are `u8`.
    pub max_clients: usize,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            mailbox_prefix: DEFAULT_MAILBOX_PREFIX.to_owned(),
            max_clients: 256,
            relay: RelayConfig::default(),
        }
    }
}

pub struct Server {
    registry: Arc<DeviceRegistry>,
    mailboxes: Arc<dyn MailboxProvider>,
    ids: ClientIds,
    prefix: String,
    sessions: CancellationToken,
}

impl Server {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        mailboxes: Arc<dyn MailboxProvider>,
        config: &ServerConfig,
    ) -> Server {
        Server {
            registry,
            mailboxes,
            ids: ClientIds::new(config.max_clients),
            prefix: config.mailbox_prefix.clone(),
            sessions: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Number of connected clients.
    pub fn clients(&self) -> usize {
        self.ids.in_use()
    }

    fn spawn_session<S>(&self, stream: S, peer: impl Debug, sessions: &mut JoinSet<()>)
    where
        S: 'static + AsyncRead + AsyncWrite + Unpin + Send,
    {
        let lease = match self.ids.lease() {
            Ok(lease) => lease,
            Err(e) => {
                warn!("refusing {:?}: {}", peer, e);
                return;
            }
        };
        info!("accepted: {:?} as client {}", peer, lease.id());

        let session = Session::new(
            lease,
            self.registry.clone(),
            self.mailboxes.clone(),
            &self.prefix,
        )
        .with_stop(self.sessions.child_token());
        sessions.spawn(async move {
            match session.run(stream).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => warn!("connection dropped: {}", e),
                Err(e) => error!("Error: {}: {:?}", e, e),
            }
        });
    }

    /// Stop every session and wait for their cleanup.
    async fn finish(&self, mut sessions: JoinSet<()>) {
        self.sessions.cancel();
        while let Some(res) = sessions.join_next().await {
            if let Err(e) = res {
                error!("session task failed: {}", e);
            }
        }
        info!("Server shutdown complete");
    }

    /// Serve connections from `listener` until `shutdown` completes.
    pub async fn serve_tcp<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        let res = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("{}: set_nodelay: {}", peer, e);
                        }
                        self.spawn_session(stream, peer, &mut sessions);
                    }
                    Err(e) => break Err(e.into()),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };

        self.finish(sessions).await;
        res
    }

    /// Unix socket counterpart of [`Server::serve_tcp`].
    pub async fn serve_unix<F>(&self, listener: &UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        let res = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer, &mut sessions),
                    Err(e) => break Err(e.into()),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };

        self.finish(sessions).await;
        res
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// The handlers are installed before this returns, so no signal is missed
/// between setup and the first poll.
pub fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
        }
    })
}

/// Listen on `addr` and serve until interrupted.
pub async fn srv_async(server: &Server, addr: &str) -> Result<()> {
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
    let shutdown = shutdown_signal()?;

    match proto {
        "tcp" => {
            let listener = TcpListener::bind(&listen_addr).await?;
            info!("listening on tcp {}", listener.local_addr()?);
            server.serve_tcp(listener, shutdown).await
        }
        "unix" => {
            let listener = DeleteOnDrop::bind(&listen_addr)?;
            info!("listening on unix {}", listen_addr);
            server.serve_unix(&listener, shutdown).await
        }
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{client::Client, loopback::LoopbackBackend, mailbox::LocalMailboxes},
        std::time::Duration,
        tokio::{io::AsyncReadExt, net::TcpStream, sync::oneshot},
    };

    struct Running {
        backend: Arc<LoopbackBackend>,
        server: Arc<Server>,
        addr: std::net::SocketAddr,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(max_clients: usize) -> Running {
        let backend = Arc::new(LoopbackBackend::with_serials(&["A"]));
        let config = ServerConfig {
            max_clients,
            ..Default::default()
        };
        let registry = Arc::new(DeviceRegistry::new(backend.clone(), config.relay.clone()));
        let server = Arc::new(Server::new(
            registry,
            Arc::new(LocalMailboxes::default()),
            &config,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .serve_tcp(listener, async move {
                        let _ = stopped.await;
                    })
                    .await
            })
        };

        Running {
            backend,
            server,
            addr,
            stop,
            task,
        }
    }

    async fn wait_for_clients(server: &Server, count: usize) {
        for _ in 0..500 {
            if server.clients() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, have {}", count, server.clients());
    }

    #[tokio::test]
    async fn refuses_when_identities_run_out() {
        let running = start(1).await;
        let mut first = Client::connect(running.addr).await.unwrap();
        assert_eq!(first.find_all().await.unwrap(), ["A"]);

        let mut second = TcpStream::connect(running.addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
        assert_eq!(running.server.clients(), 1);

        drop(first);
        wait_for_clients(&running.server, 0).await;
        let mut third = Client::connect(running.addr).await.unwrap();
        assert_eq!(third.find_all().await.unwrap(), ["A"]);
    }

    #[tokio::test]
    async fn shutdown_tears_sessions_down() {
        let running = start(8).await;
        let mut client = Client::connect(running.addr).await.unwrap();
        client.find_all().await.unwrap();
        assert!(client.device_open("A").await.unwrap());
        assert!(running.backend.adapter("A").unwrap().stats().is_open);

        running.stop.send(()).unwrap();
        running.task.await.unwrap().unwrap();

        assert!(!running.backend.adapter("A").unwrap().stats().is_open);
        assert_eq!(running.server.clients(), 0);
        assert!(client.find_all().await.is_err());
    }

    #[tokio::test]
    async fn unix_socket_is_removed_after_shutdown() {
        let path = std::env::temp_dir().join(format!("hwbroker-test-{}.sock", std::process::id()));
        let backend = Arc::new(LoopbackBackend::with_serials(&["A"]));
        let registry = Arc::new(DeviceRegistry::new(backend, RelayConfig::default()));
        let server = Server::new(
            registry,
            Arc::new(LocalMailboxes::default()),
            &ServerConfig::default(),
        );

        let _ = std::fs::remove_file(&path);
        let listener = DeleteOnDrop::bind(&path).unwrap();
        assert!(path.exists());
        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut client = Client::new(stream);

        let (stop, stopped) = oneshot::channel::<()>();
        let serve = server.serve_unix(&listener, async move {
            let _ = stopped.await;
        });
        let drive = async {
            assert_eq!(client.find_all().await.unwrap(), ["A"]);
            stop.send(()).unwrap();
        };
        let (res, ()) = tokio::join!(serve, drive);
        res.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bad_address_is_rejected() {
        let backend = Arc::new(LoopbackBackend::default());
        let registry = Arc::new(DeviceRegistry::new(backend, RelayConfig::default()));
        let server = Server::new(
            registry,
            Arc::new(LocalMailboxes::default()),
            &ServerConfig::default(),
        );
        assert!(srv_async(&server, "tcp!127.0.0.1").await.is_err());
        assert!(srv_async(&server, "udp!127.0.0.1!0").await.is_err());
    }
}
