use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::{ACCEPT_RETRY_DELAY, HANDSHAKE_TIMEOUT, REPORT_INTERVAL};
use crate::handshake::{self, HelloCode, ServerHello};
use crate::listeners::PublicListeners;
use crate::logger::Logger;
use crate::registry::AgentConnections;
use crate::secret::{ConnectionSecret, SecretPortMap};
use crate::{log_debug, log_error, log_event, log_info};

pub struct RelayConfig {
    pub listen_address: String,
    pub secret_ports: Vec<(ConnectionSecret, u16)>,
}

/// The public-facing relay: accepts agent connections on the listen address,
/// validates their handshake, files them into per-secret idle pools and
/// provisions one public listener per known secret on demand.
pub struct Relay {
    logger: Logger,
    listener: TcpListener,
    public_bind_ip: IpAddr,
    secret_ports: Arc<SecretPortMap>,
    agent_conns: Arc<AgentConnections>,
    public_listeners: Arc<PublicListeners>,
    cancel: CancellationToken,
}

impl Relay {
    pub async fn bind(config: RelayConfig, logger: Logger) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_address).await.map_err(|e| {
            anyhow::anyhow!("bind: failed to listen on {}: {}", config.listen_address, e)
        })?;
        // Public listeners bind on the same interface the agent listener uses.
        let public_bind_ip = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("bind: local addr: {}", e))?
            .ip();

        let secret_ports = Arc::new(SecretPortMap::new());
        for (secret, port) in &config.secret_ports {
            secret_ports.set(*secret, *port).await;
        }

        let cancel = CancellationToken::new();
        let agent_conns = Arc::new(AgentConnections::new());
        let public_listeners = Arc::new(PublicListeners::new(
            agent_conns.clone(),
            logger.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            logger,
            listener,
            public_bind_ip,
            secret_ports,
            agent_conns,
            public_listeners,
            cancel,
        })
    }

    /// Address of the agent-facing listener.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("localAddr: {}", e))
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// (pools, idle connections) snapshot across all secrets.
    pub async fn idle_stats(&self) -> (usize, usize) {
        self.agent_conns.stats().await
    }

    /// Address of the public listener serving `secret`, once provisioned.
    pub async fn public_addr(&self, secret: &ConnectionSecret) -> Option<SocketAddr> {
        self.public_listeners.bound_addr(secret).await
    }

    pub async fn run(&self) {
        let listen_addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        log_info!(
            self.logger,
            "Relay started: agent listener on {} with {} configured secrets",
            listen_addr,
            self.secret_ports.len().await
        );

        // Periodic checkpoint report
        let report_cancel = self.cancel.clone();
        let report_logger = self.logger.clone();
        let report_conns = self.agent_conns.clone();
        let report_listeners = self.public_listeners.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPORT_INTERVAL());
            loop {
                tokio::select! {
                    _ = report_cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let (pools, idle) = report_conns.stats().await;
                        let (tx, rx) = report_listeners.transferred();
                        log_event!(
                            report_logger,
                            "CHECK_POINT|POOLS={}|IDLE={}|TCPTX={}|TCPRX={}",
                            pools, idle, tx, rx,
                        );
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            log_error!(self.logger, "Failed to accept agent connection: {}", e);
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            continue;
                        }
                    };

                    let logger = self.logger.clone();
                    let secret_ports = self.secret_ports.clone();
                    let agent_conns = self.agent_conns.clone();
                    let public_listeners = self.public_listeners.clone();
                    let public_bind_ip = self.public_bind_ip;

                    tokio::spawn(async move {
                        if let Err(e) = handle_agent_conn(
                            stream,
                            addr,
                            secret_ports,
                            agent_conns,
                            public_listeners,
                            public_bind_ip,
                            logger.clone(),
                        )
                        .await
                        {
                            log_error!(logger, "Failed to handle agent connection from {}: {}", addr, e);
                        }
                    });
                }
            }
        }

        log_info!(self.logger, "Relay shutdown complete");
    }
}

/// One accepted agent connection: read the ClientHello, answer, pool the
/// stream, make sure its public listener exists.
async fn handle_agent_conn(
    mut stream: TcpStream,
    addr: SocketAddr,
    secret_ports: Arc<SecretPortMap>,
    agent_conns: Arc<AgentConnections>,
    public_listeners: Arc<PublicListeners>,
    public_bind_ip: IpAddr,
    logger: Logger,
) -> anyhow::Result<()> {
    let hello = {
        let timeout = HANDSHAKE_TIMEOUT();
        if timeout.is_zero() {
            handshake::read_client_hello(&mut stream).await?
        } else {
            tokio::time::timeout(timeout, handshake::read_client_hello(&mut stream))
                .await
                .map_err(|_| anyhow::anyhow!("handleAgent: handshake timeout"))??
        }
    };

    let secret = hello.connection_secret;
    let Some(server_port) = secret_ports.get(&secret).await else {
        log_error!(logger, "Unknown connection secret {:?} from {}", secret, addr);
        let reply = ServerHello {
            code: HelloCode::InvalidSecret,
            server_port: 0,
        };
        handshake::write_server_hello(&mut stream, &reply).await?;
        return Ok(());
    };

    let reply = ServerHello {
        code: HelloCode::Ok,
        server_port,
    };
    handshake::write_server_hello(&mut stream, &reply).await?;

    log_debug!(logger, "Agent connection pooled: {:?} from {}", secret, addr);
    agent_conns.add_connection(secret, stream).await;

    public_listeners
        .listen_if_not_already(secret, public_bind_ip, server_port)
        .await?;

    Ok(())
}
