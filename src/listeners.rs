use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ACCEPT_RETRY_DELAY, TCP_DATA_BUF_SIZE};
use crate::conn::data_exchange;
use crate::logger::Logger;
use crate::registry::AgentConnections;
use crate::secret::ConnectionSecret;
use crate::{log_debug, log_error, log_warn};

/// One public listener per secret, created lazily on the first successful
/// handshake and kept for the lifetime of the relay.
pub struct PublicListeners {
    listeners: Mutex<HashMap<ConnectionSecret, SocketAddr>>,
    agent_conns: Arc<AgentConnections>,
    logger: Logger,
    cancel: CancellationToken,
    tcp_rx: Arc<AtomicU64>,
    tcp_tx: Arc<AtomicU64>,
}

impl PublicListeners {
    pub fn new(
        agent_conns: Arc<AgentConnections>,
        logger: Logger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            agent_conns,
            logger,
            cancel,
            tcp_rx: Arc::new(AtomicU64::new(0)),
            tcp_tx: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the public port for `secret` unless one is already serving it.
    /// Idempotent after the first success. A bind failure records nothing,
    /// so a later handshake retries the bind.
    ///
    /// The registry lock is held across the bind call; contention here is
    /// limited to first-handshake-per-secret events.
    pub async fn listen_if_not_already(
        &self,
        secret: ConnectionSecret,
        bind_ip: IpAddr,
        port: u16,
    ) -> anyhow::Result<()> {
        let mut listeners = self.listeners.lock().await;

        if listeners.contains_key(&secret) {
            return Ok(());
        }

        let listener = TcpListener::bind((bind_ip, port))
            .await
            .map_err(|e| anyhow::anyhow!("listenIfNotAlready: failed to listen on {}:{}: {}", bind_ip, port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("listenIfNotAlready: local addr: {}", e))?;
        listeners.insert(secret, local_addr);
        drop(listeners);

        log_debug!(self.logger, "Public listener for {:?} on {}", secret, local_addr);

        let agent_conns = self.agent_conns.clone();
        let logger = self.logger.clone();
        let cancel = self.cancel.clone();
        let tcp_rx = self.tcp_rx.clone();
        let tcp_tx = self.tcp_tx.clone();
        tokio::spawn(async move {
            accept_loop(listener, secret, agent_conns, logger, cancel, tcp_rx, tcp_tx).await;
        });

        Ok(())
    }

    /// Address the public listener for `secret` is bound to, if any.
    pub async fn bound_addr(&self, secret: &ConnectionSecret) -> Option<SocketAddr> {
        self.listeners.lock().await.get(secret).copied()
    }

    /// Cumulative (user→agent, agent→user) bytes over all bridged sessions.
    pub fn transferred(&self) -> (u64, u64) {
        (
            self.tcp_tx.load(Ordering::Relaxed),
            self.tcp_rx.load(Ordering::Relaxed),
        )
    }
}

async fn accept_loop(
    listener: TcpListener,
    secret: ConnectionSecret,
    agent_conns: Arc<AgentConnections>,
    logger: Logger,
    cancel: CancellationToken,
    tcp_rx: Arc<AtomicU64>,
    tcp_tx: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = listener.accept() => {
                let (user_conn, user_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        log_error!(logger, "Failed to accept user connection for {:?}: {}", secret, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                };

                let agent_conns = agent_conns.clone();
                let logger = logger.clone();
                let tcp_rx = tcp_rx.clone();
                let tcp_tx = tcp_tx.clone();
                tokio::spawn(async move {
                    handle_user_conn(secret, user_conn, user_addr, agent_conns, logger, tcp_rx, tcp_tx).await;
                });
            }
        }
    }
}

/// Pair one user connection with the head of the idle pool and bridge them.
/// With an empty pool the user connection is closed; refilling the pool is
/// the agent's job, user connections are never queued.
async fn handle_user_conn(
    secret: ConnectionSecret,
    user_conn: TcpStream,
    user_addr: SocketAddr,
    agent_conns: Arc<AgentConnections>,
    logger: Logger,
    tcp_rx: Arc<AtomicU64>,
    tcp_tx: Arc<AtomicU64>,
) {
    let Some(agent_conn) = agent_conns.take_connection(&secret).await else {
        log_warn!(logger, "No idle agent connection for {:?}, closing user {}", secret, user_addr);
        return;
    };

    log_debug!(logger, "Starting exchange: {} <-> pooled agent connection", user_addr);
    let (tx, rx) = data_exchange(user_conn, agent_conn, TCP_DATA_BUF_SIZE()).await;
    tcp_tx.fetch_add(tx, Ordering::Relaxed);
    tcp_rx.fetch_add(rx, Ordering::Relaxed);
    log_debug!(logger, "Exchange complete: {} TX={} RX={}", user_addr, tx, rx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn quiet_logger() -> Logger {
        Logger::new(LogLevel::None, false)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn listen_is_idempotent() {
        let listeners = PublicListeners::new(
            Arc::new(AgentConnections::new()),
            quiet_logger(),
            CancellationToken::new(),
        );
        let secret = ConnectionSecret::from_bytes([9u8; 16]);
        let port = free_port();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        listeners.listen_if_not_already(secret, ip, port).await.unwrap();
        let addr = listeners.bound_addr(&secret).await.unwrap();

        // Second and third calls must succeed without re-binding.
        listeners.listen_if_not_already(secret, ip, port).await.unwrap();
        listeners.listen_if_not_already(secret, ip, port).await.unwrap();
        assert_eq!(listeners.bound_addr(&secret).await, Some(addr));
    }

    #[tokio::test]
    async fn empty_pool_closes_user_connection() {
        let listeners = PublicListeners::new(
            Arc::new(AgentConnections::new()),
            quiet_logger(),
            CancellationToken::new(),
        );
        let secret = ConnectionSecret::from_bytes([4u8; 16]);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        listeners.listen_if_not_already(secret, ip, free_port()).await.unwrap();
        let addr = listeners.bound_addr(&secret).await.unwrap();

        let mut user = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), user.read(&mut buf))
            .await
            .expect("user connection was not closed")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn bind_failure_is_not_recorded() {
        let listeners = PublicListeners::new(
            Arc::new(AgentConnections::new()),
            quiet_logger(),
            CancellationToken::new(),
        );
        let secret = ConnectionSecret::from_bytes([5u8; 16]);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        // Occupy a port, then ask for it.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        assert!(listeners.listen_if_not_already(secret, ip, port).await.is_err());
        assert!(listeners.bound_addr(&secret).await.is_none());

        // Once the port frees up, a later handshake can retry.
        drop(blocker);
        listeners.listen_if_not_already(secret, ip, port).await.unwrap();
        assert!(listeners.bound_addr(&secret).await.is_some());
    }
}
