use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Bidirectional data exchange between two connections.
///
/// Runs one copy task per direction. As soon as either direction finishes
/// (EOF or error) both streams are closed, which unblocks the other
/// direction. Returns the byte counts (conn1→conn2, conn2→conn1).
pub async fn data_exchange<A, B>(conn1: A, conn2: B, buf_size: usize) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut r1, mut w1) = tokio::io::split(conn1);
    let (mut r2, mut w2) = tokio::io::split(conn2);

    let forward = Arc::new(AtomicU64::new(0));
    let backward = Arc::new(AtomicU64::new(0));
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(2);

    let count = forward.clone();
    let stop = stop_tx.clone();
    let h1 = tokio::spawn(async move {
        let mut buf = vec![0u8; buf_size];
        let _ = copy_with_buf(&mut r1, &mut w2, &mut buf, &count).await;
        let _ = w2.shutdown().await;
        let _ = stop.send(()).await;
    });

    let count = backward.clone();
    let stop = stop_tx.clone();
    let h2 = tokio::spawn(async move {
        let mut buf = vec![0u8; buf_size];
        let _ = copy_with_buf(&mut r2, &mut w1, &mut buf, &count).await;
        let _ = w1.shutdown().await;
        let _ = stop.send(()).await;
    });

    drop(stop_tx);

    // Wait for the first direction to finish, then drop all four halves by
    // aborting both tasks. That closes both streams on every exit path.
    let _ = stop_rx.recv().await;
    h1.abort();
    h2.abort();
    let _ = h1.await;
    let _ = h2.await;

    (
        forward.load(Ordering::Relaxed),
        backward.load(Ordering::Relaxed),
    )
}

async fn copy_with_buf<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    total: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
}
