use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{FIRST_READ_BUF_SIZE, HANDSHAKE_TIMEOUT, REPORT_INTERVAL, TCP_DATA_BUF_SIZE};
use crate::conn::data_exchange;
use crate::handshake::{self, ClientHello, HelloCode};
use crate::logger::Logger;
use crate::secret::ConnectionSecret;
use crate::{log_debug, log_error, log_event, log_info};

pub struct AgentConfig {
    pub pool_size: usize,
    pub server_address: String,
    pub destination_address: String,
    pub connection_secret: ConnectionSecret,
    pub retry_interval: Duration,
}

/// The client-side agent: keeps `pool_size` handshake-completed connections
/// to the relay open and idle. Each one waits for its first user byte, then
/// dials the hidden destination and bridges the two streams.
pub struct Agent {
    config: AgentConfig,
    logger: Logger,
    cancel: CancellationToken,
    tcp_rx: Arc<AtomicU64>,
    tcp_tx: Arc<AtomicU64>,
}

impl Agent {
    pub fn new(config: AgentConfig, logger: Logger) -> Self {
        Self {
            config,
            logger,
            cancel: CancellationToken::new(),
            tcp_rx: Arc::new(AtomicU64::new(0)),
            tcp_tx: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Maintain the pool until cancelled. A failed dial to the relay is
    /// fatal and surfaces as the returned error; a rejected or failed
    /// handshake closes the stream and retries after `retry_interval`.
    pub async fn run(&self) -> anyhow::Result<()> {
        log_info!(
            self.logger,
            "Agent started: relay={} destination={} pool={}",
            self.config.server_address,
            self.config.destination_address,
            self.config.pool_size,
        );

        // One permit per pool slot. A slot is occupied from just before the
        // handshake until the bridge sees its first read complete.
        let slots = Arc::new(Semaphore::new(self.config.pool_size));

        let report_cancel = self.cancel.clone();
        let report_logger = self.logger.clone();
        let report_slots = slots.clone();
        let report_rx = self.tcp_rx.clone();
        let report_tx = self.tcp_tx.clone();
        let pool_size = self.config.pool_size;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPORT_INTERVAL());
            loop {
                tokio::select! {
                    _ = report_cancel.cancelled() => return,
                    _ = interval.tick() => {
                        log_event!(
                            report_logger,
                            "CHECK_POINT|POOL={}/{}|TCPTX={}|TCPRX={}",
                            pool_size - report_slots.available_permits(),
                            pool_size,
                            report_tx.load(Ordering::Relaxed),
                            report_rx.load(Ordering::Relaxed),
                        );
                    }
                }
            }
        });

        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                permit = slots.clone().acquire_owned() => permit
                    .map_err(|e| anyhow::anyhow!("maintainPool: semaphore closed: {}", e))?,
            };

            log_debug!(
                self.logger,
                "Creating new connection: current={} max={}",
                self.config.pool_size - slots.available_permits(),
                self.config.pool_size,
            );

            let mut stream = TcpStream::connect(&self.config.server_address)
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "maintainPool: failed to connect to relay {}: {}",
                        self.config.server_address,
                        e
                    )
                })?;

            match perform_handshake(&mut stream, self.config.connection_secret).await {
                Ok(()) => {
                    let destination = self.config.destination_address.clone();
                    let logger = self.logger.clone();
                    let cancel = self.cancel.clone();
                    let tcp_rx = self.tcp_rx.clone();
                    let tcp_tx = self.tcp_tx.clone();
                    tokio::spawn(async move {
                        bridge(stream, permit, destination, logger, cancel, tcp_rx, tcp_tx).await;
                    });
                }
                Err(e) => {
                    log_error!(self.logger, "Handshake failed: {}", e);
                    // Close before the retry sleep.
                    drop(stream);
                    drop(permit);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
            }
        }
    }
}

/// Write the ClientHello and wait for a positive ServerHello. The port in
/// the reply is informational only and never interpreted here.
async fn perform_handshake<S>(stream: &mut S, secret: ConnectionSecret) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake::write_client_hello(
        stream,
        &ClientHello {
            connection_secret: secret,
        },
    )
    .await?;

    let timeout = HANDSHAKE_TIMEOUT();
    let reply = if timeout.is_zero() {
        handshake::read_server_hello(stream).await?
    } else {
        tokio::time::timeout(timeout, handshake::read_server_hello(stream))
            .await
            .map_err(|_| anyhow::anyhow!("handshake: timeout waiting for server hello"))??
    };

    if reply.code != HelloCode::Ok {
        anyhow::bail!("handshake: server rejected connection: {:?}", reply.code);
    }

    Ok(())
}

/// One pooled connection. Blocks until the relay forwards the first user
/// bytes, frees the pool slot, then dials the destination and bridges.
/// The first buffered bytes are written before the copy loops start.
async fn bridge(
    mut relay_conn: TcpStream,
    permit: OwnedSemaphorePermit,
    destination: String,
    logger: Logger,
    cancel: CancellationToken,
    tcp_rx: Arc<AtomicU64>,
    tcp_tx: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; FIRST_READ_BUF_SIZE()];
    let first = tokio::select! {
        _ = cancel.cancelled() => {
            drop(permit);
            return;
        }
        result = relay_conn.read(&mut buf) => result,
    };

    // The slot frees as soon as this connection stops being idle, whatever
    // the first read returned. The maintainer can dial a replacement while
    // this bridge keeps running.
    drop(permit);

    let n = match first {
        Ok(0) => {
            log_debug!(logger, "Connection closed by relay");
            return;
        }
        Ok(n) => n,
        Err(e) => {
            log_debug!(logger, "Failed to read from relay: {}", e);
            return;
        }
    };

    let mut dest_conn = match TcpStream::connect(&destination).await {
        Ok(conn) => conn,
        Err(e) => {
            log_error!(logger, "Failed to connect to destination {}: {}", destination, e);
            return;
        }
    };

    if let Err(e) = dest_conn.write_all(&buf[..n]).await {
        log_error!(logger, "Failed to write to destination {}: {}", destination, e);
        return;
    }
    tcp_tx.fetch_add(n as u64, Ordering::Relaxed);

    log_debug!(logger, "Starting exchange: relay <-> {}", destination);
    let (tx, rx) = data_exchange(relay_conn, dest_conn, TCP_DATA_BUF_SIZE()).await;
    tcp_tx.fetch_add(tx, Ordering::Relaxed);
    tcp_rx.fetch_add(rx, Ordering::Relaxed);
    log_debug!(logger, "Exchange complete: TX={} RX={}", n as u64 + tx, rx);
}
