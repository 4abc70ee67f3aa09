//! Bidirectional stream copying for forwarding sessions.
//!
//! Each accepted local connection is piped to its own port-forward stream.
//! Byte and connection counters are shared per session so the orchestrator
//! can report traffic without talking to the relay tasks.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Traffic counters for one forwarding session. All fields are atomic.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Bytes copied from local clients to the pod.
    pub bytes_to_pod: AtomicU64,
    /// Bytes copied from the pod back to local clients.
    pub bytes_to_local: AtomicU64,
    pub active_connections: AtomicU32,
    pub total_connections: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            bytes_to_pod: self.bytes_to_pod.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub bytes_to_pod: u64,
    pub bytes_to_local: u64,
    pub active_connections: u32,
    pub total_connections: u64,
}

/// Counts a connection as active for as long as it is alive.
struct ConnectionGuard<'a> {
    stats: &'a RelayStats,
}

impl<'a> ConnectionGuard<'a> {
    fn new(stats: &'a RelayStats) -> Self {
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pipes bytes between a local connection and a pod stream until both
/// directions finish. Returns `(bytes_to_pod, bytes_to_local)`.
pub async fn pipe<L, R>(local: L, remote: R, stats: &RelayStats) -> Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = ConnectionGuard::new(stats);

    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let (up, down) = tokio::join!(
        copy_counted(local_read, remote_write, &stats.bytes_to_pod),
        copy_counted(remote_read, local_write, &stats.bytes_to_local),
    );

    Ok((up?, down?))
}

/// Copies data from reader to writer, adding every chunk to `counter`.
async fn copy_counted<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!("Read error: {}", e);
                return Err(e.into());
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!("Write error: {}", e);
            return Err(e.into());
        }

        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Half-close so the peer sees EOF.
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown error: {}", e);
    }

    debug!("Stream copy completed, total {} bytes", total);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pipe_counts_both_directions() {
        let (local, mut client) = duplex(1024);
        let (remote, mut pod) = duplex(1024);
        let stats = RelayStats::new();

        // Echo server on the pod side.
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match pod.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if pod.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = pod.shutdown().await;
        });

        let client_task = tokio::spawn(async move {
            client.write_all(b"hello").await.unwrap();
            client.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            echoed
        });

        let (up, down) = pipe(local, remote, &stats).await.unwrap();
        assert_eq!(up, 5);
        assert_eq!(down, 5);
        assert_eq!(client_task.await.unwrap(), b"hello");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_to_pod, 5);
        assert_eq!(snapshot.bytes_to_local, 5);
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.active_connections, 0);
    }
}
