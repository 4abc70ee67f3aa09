//! Port-forward sessions with background relay tasks.
//!
//! A session owns a loopback listener on its local port and forwards every
//! accepted connection to one pod port through the cluster's port-forward
//! sub-resource. Each session runs as its own task; the engine keeps only a
//! handle holding the stop signal.
//!
//! Lifecycle: `Starting -> Ready | Failed`, then `Ready -> Stopped` on
//! [`PortForwardEngine::stop`]. There is no reconnect. When the pod stops
//! accepting port-forward upgrades the task ends and removes its own entry,
//! so a later `stop` reports not-found.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::k8s::{BoxedStream, ClusterClient};
use crate::pipe::{pipe, RelayStats, RelayStatsSnapshot};

/// Identity of a forwarding session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub context: String,
    pub namespace: String,
    pub pod: String,
    pub remote_port: u16,
}

impl SessionKey {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            remote_port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.context, self.namespace, self.pod, self.remote_port
        )
    }
}

/// Read-only view of an active session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub local_port: u16,
    pub stats: RelayStatsSnapshot,
}

struct SessionHandle {
    id: u64,
    local_port: u16,
    stats: Arc<RelayStats>,
    stop: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

type SessionMap = Arc<DashMap<SessionKey, SessionHandle>>;

/// Opens and closes forwarding sessions.
pub struct PortForwardEngine {
    cluster: Arc<dyn ClusterClient>,
    sessions: SessionMap,
    next_id: AtomicU64,
    ready_timeout: Duration,
}

impl PortForwardEngine {
    pub fn new(cluster: Arc<dyn ClusterClient>, ready_timeout: Duration) -> Self {
        Self {
            cluster,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            ready_timeout,
        }
    }

    /// Starts a session and waits until it is ready or has failed.
    ///
    /// The listener is bound before this returns; the relay keeps running in
    /// the background afterwards. Duplicate keys are rejected.
    pub async fn start(&self, key: SessionKey, local_port: u16) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(RelayStats::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => return Err(TunnelError::SessionExists(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(SessionHandle {
                    id,
                    local_port,
                    stats: Arc::clone(&stats),
                    stop: Some(stop_tx),
                });
            }
        }

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.discard(&key, id);
                return Err(TunnelError::cluster(
                    "bind local port",
                    anyhow::Error::new(e).context(format!("127.0.0.1:{}", local_port)),
                ));
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let session = Session {
            id,
            key: key.clone(),
            cluster: Arc::clone(&self.cluster),
            sessions: Arc::clone(&self.sessions),
            stats,
        };
        tokio::spawn(session.run(listener, stop_rx, ready_tx));

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Port-forward ready: 127.0.0.1:{} -> {}", local_port, key);
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                self.discard(&key, id);
                Err(e)
            }
            Ok(Err(_)) => {
                self.discard(&key, id);
                Err(TunnelError::cluster(
                    "start port forward",
                    anyhow::anyhow!("session ended before becoming ready"),
                ))
            }
            Err(_) => {
                self.discard(&key, id);
                Err(TunnelError::Timeout("port forward readiness"))
            }
        }
    }

    /// Signals the session to stop and forgets it. Does not wait for teardown.
    pub fn stop(&self, key: &SessionKey) -> Result<()> {
        let (_, mut handle) = self
            .sessions
            .remove(key)
            .ok_or_else(|| TunnelError::SessionNotFound(key.to_string()))?;
        handle.signal_stop();
        debug!("Stop signalled for port-forward {}", key);
        Ok(())
    }

    /// Best-effort stop of every session.
    pub fn stop_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let _ = self.stop(&key);
        }
        info!("Stopped all port-forwards");
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|e| SessionInfo {
                key: e.key().clone(),
                local_port: e.local_port,
                stats: e.stats.snapshot(),
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Local ports held by live sessions.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.sessions.iter().map(|e| e.local_port).collect()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn stats(&self, key: &SessionKey) -> Option<RelayStatsSnapshot> {
        self.sessions.get(key).map(|e| e.stats.snapshot())
    }

    /// Removes the entry only if it still belongs to session `id`.
    fn discard(&self, key: &SessionKey, id: u64) {
        if let Some((_, mut handle)) = self.sessions.remove_if(key, |_, h| h.id == id) {
            handle.signal_stop();
        }
    }
}

/// State moved into a session's background task.
struct Session {
    id: u64,
    key: SessionKey,
    cluster: Arc<dyn ClusterClient>,
    sessions: SessionMap,
    stats: Arc<RelayStats>,
}

impl Session {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        self.cluster
            .open_port_forward_stream(
                &self.key.context,
                &self.key.namespace,
                &self.key.pod,
                self.key.remote_port,
            )
            .await
    }

    async fn run(
        self,
        listener: TcpListener,
        mut stop_rx: oneshot::Receiver<()>,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        // The first upgrade proves the pod is reachable and serves the first
        // accepted connection.
        let mut warm = tokio::select! {
            _ = &mut stop_rx => {
                debug!("Port-forward {} stopped before ready", self.key);
                return;
            }
            opened = self.open_stream() => match opened {
                Ok(stream) => Some(stream),
                Err(e) => {
                    let _ = ready_tx.send(Err(TunnelError::cluster("open port-forward stream", e)));
                    return;
                }
            },
        };

        if ready_tx.send(Ok(())).is_err() {
            // Caller gave up waiting.
            return;
        }

        let session = Arc::new(self);
        let mut connections: JoinSet<anyhow::Result<()>> = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!("Port-forward {} received stop", session.key);
                    break;
                }

                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed on port-forward {}: {}", session.key, e);
                            break;
                        }
                    };
                    debug!("Connection from {} for {}", peer, session.key);

                    let warm_stream = warm.take();
                    let session = Arc::clone(&session);
                    connections.spawn(async move {
                        let stream = match warm_stream {
                            Some(stream) => stream,
                            None => session.open_stream().await?,
                        };
                        match pipe(socket, stream, &session.stats).await {
                            Ok((up, down)) => debug!(
                                "Connection {} -> {} done (tx: {} bytes, rx: {} bytes)",
                                peer, session.key, up, down
                            ),
                            Err(e) => debug!("Connection {} -> {} error: {}", peer, session.key, e),
                        }
                        Ok(())
                    });
                }

                Some(joined) = connections.join_next() => {
                    if let Ok(Err(e)) = joined {
                        warn!("Lost connection to pod for {}: {:#}", session.key, e);
                        break;
                    }
                }
            }
        }

        // Dropping the join set aborts in-flight relays.
        drop(connections);
        drop(listener);

        if session
            .sessions
            .remove_if(&session.key, |_, h| h.id == session.id)
            .is_some()
        {
            info!("Port-forward {} ended", session.key);
        } else {
            info!("Port-forward {} stopped", session.key);
        }
    }
}
