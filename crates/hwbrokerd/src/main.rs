use {
    clap::Parser,
    hwbroker::{
        loopback::LoopbackBackend,
        mailbox::LocalMailboxes,
        registry::DeviceRegistry,
        srv::{Server, ServerConfig, srv_async},
        *,
    },
    log::{info, warn},
    std::sync::Arc,
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value_t = format!("tcp!0.0.0.0!{}", RPC_PORT))]
    address: String,

    /// Attach an in-process loopback adapter with this serial
    #[arg(long = "loopback", value_name = "SERIAL")]
    loopback: Vec<String>,

    /// Payload bytes carried by one mailbox frame
    #[arg(long, default_value_t = hwbroker::mailbox::local::DEFAULT_FRAME_CAPACITY)]
    frame_capacity: usize,

    /// Frames a mailbox holds before writers have to wait
    #[arg(long, default_value_t = hwbroker::mailbox::local::DEFAULT_DEPTH)]
    mailbox_depth: usize,

    /// First component of every mailbox name
    #[arg(long, default_value_t = DEFAULT_MAILBOX_PREFIX.to_owned())]
    mailbox_prefix: String,

    /// Maximum number of connected clients (at most 256)
    #[arg(long, default_value_t = 256)]
    max_clients: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            mailbox_prefix: self.mailbox_prefix.clone(),
            max_clients: self.max_clients,
            ..Default::default()
        }
    }
}

async fn hwbrokerd_main(cli: Cli) -> hwbroker::Result<i32> {
    if cli.loopback.is_empty() {
        warn!("no adapters attached; pass --loopback SERIAL to add one");
    }
    let serials: Vec<&str> = cli.loopback.iter().map(String::as_str).collect();
    let backend = Arc::new(LoopbackBackend::with_serials(&serials));
    let mailboxes = Arc::new(LocalMailboxes::new(cli.frame_capacity, cli.mailbox_depth));

    let config = cli.server_config();
    let registry = Arc::new(DeviceRegistry::new(backend, config.relay.clone()));
    let server = Server::new(registry.clone(), mailboxes, &config);

    info!("Ready to accept clients: {}", cli.address);
    let res = srv_async(&server, &cli.address).await;
    registry.shutdown().await;
    res.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = hwbrokerd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
