use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use burrow::agent::{Agent, AgentConfig};
use burrow::config::RETRY_INTERVAL;
use burrow::log_info;
use burrow::logger::{LogLevel, Logger};
use burrow::relay::{Relay, RelayConfig};
use burrow::secret::{parse_conf_entry, ConnectionSecret};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "burrow", version)]
#[command(about = "Reverse TCP tunnel: expose services behind NAT through a public relay")]
struct Cli {
    /// Log level: none, event, error, warn, info, debug
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Public-facing relay: accepts agent connections and bridges them with
    /// user connections on per-secret public ports.
    Relay {
        /// Agent-facing listen host:port
        #[arg(long, default_value = "localhost:9253")]
        listen_address: String,

        /// base64secret:port mapping, may be given multiple times
        #[arg(long = "conf", value_name = "SECRET:PORT")]
        conf: Vec<String>,
    },
    /// Agent: runs next to the hidden service and dials out to the relay.
    Agent {
        /// Target idle pool size
        #[arg(long, default_value_t = 10)]
        conn_pool_size: usize,

        /// Relay host:port
        #[arg(long, default_value = "localhost:9253")]
        server_address: String,

        /// Hidden-service host:port
        #[arg(long, default_value = "localhost:8080")]
        destination_address: String,

        /// Base64-encoded 16-byte connection secret
        #[arg(long)]
        connection_secret: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = start(cli).await {
        exit(err);
    }
}

async fn start(cli: Cli) -> anyhow::Result<()> {
    let logger = init_logger(&cli.log_level);

    match cli.command {
        Command::Relay {
            listen_address,
            conf,
        } => {
            let mut secret_ports = Vec::new();
            for entry in &conf {
                secret_ports.push(parse_conf_entry(entry)?);
            }
            if secret_ports.is_empty() {
                logger.warn("No --conf entries given, every agent handshake will be rejected");
            }

            log_info!(logger, "burrow relay version {}", VERSION);

            let relay = Relay::bind(
                RelayConfig {
                    listen_address,
                    secret_ports,
                },
                logger.clone(),
            )
            .await?;
            install_signal_handlers(relay.cancel_token());
            relay.run().await;
            Ok(())
        }
        Command::Agent {
            conn_pool_size,
            server_address,
            destination_address,
            connection_secret,
        } => {
            let secret = ConnectionSecret::from_base64(&connection_secret)?;

            log_info!(logger, "burrow agent version {}", VERSION);

            let agent = Agent::new(
                AgentConfig {
                    pool_size: conn_pool_size,
                    server_address,
                    destination_address,
                    connection_secret: secret,
                    retry_interval: RETRY_INTERVAL(),
                },
                logger,
            );
            install_signal_handlers(agent.cancel_token());
            agent.run().await
        }
    }
}

fn init_logger(level: &str) -> Logger {
    let level = LogLevel::parse(level).unwrap_or(LogLevel::Info);
    let logger = Logger::new(level, true);
    if level == LogLevel::Debug {
        logger.debug("Init log level: DEBUG");
    }
    logger
}

fn install_signal_handlers(cancel: CancellationToken) {
    let cancel_int = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_int.cancel();
    });

    #[cfg(unix)]
    {
        let cancel_term = cancel.clone();
        tokio::spawn(async move {
            let mut sig =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(_) => return,
                };
            sig.recv().await;
            cancel_term.cancel();
        });
    }
}

fn exit(err: anyhow::Error) {
    eprintln!(
        "burrow-{} {}/{} pid={} error={}",
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::process::id(),
        err,
    );
    std::process::exit(1);
}
