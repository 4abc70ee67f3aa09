//! API-specific data transfer objects.

use serde::Serialize;

use crate::pipe::RelayStatsSnapshot;
use crate::tunnel::{Tunnel, TunnelStatus, TunnelUpdate};

/// Information about a single tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub dns_name: String,
    /// URL reachable through the reverse proxy.
    pub url: String,
    pub context: String,
    pub namespace: String,
    pub service: String,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub service_port: u16,
    /// `active` or `degraded`.
    pub state: &'static str,
    pub stats: RelayStatsSnapshot,
}

impl TunnelInfo {
    fn new(tunnel: &Tunnel, stats: RelayStatsSnapshot) -> Self {
        Self {
            dns_name: tunnel.dns_name.clone(),
            url: format!("http://{}", tunnel.dns_name),
            context: tunnel.context.clone(),
            namespace: tunnel.namespace.clone(),
            service: tunnel.service.clone(),
            pod: tunnel.pod.clone(),
            local_port: tunnel.local_port,
            remote_port: tunnel.remote_port,
            service_port: tunnel.service_port,
            state: tunnel.state.as_str(),
            stats,
        }
    }
}

impl From<TunnelStatus> for TunnelInfo {
    fn from(status: TunnelStatus) -> Self {
        TunnelInfo::new(&status.tunnel, status.stats)
    }
}

impl From<&Tunnel> for TunnelInfo {
    fn from(tunnel: &Tunnel) -> Self {
        TunnelInfo::new(tunnel, RelayStatsSnapshot::default())
    }
}

/// A snapshot of all registered tunnels.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnels: Vec<TunnelInfo>,
}

/// Error body for failed requests.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// SSE event wrapper for tunnel updates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Initial snapshot of all tunnels (sent on connection).
    Snapshot { tunnels: Vec<TunnelInfo> },
    TunnelRegistered { tunnel: TunnelInfo },
    TunnelUnregistered { dns_name: String },
    /// The tunnel is registered but has no live session.
    TunnelDegraded { tunnel: TunnelInfo },
}

impl TunnelEvent {
    pub fn from_update(update: TunnelUpdate) -> Self {
        match update {
            TunnelUpdate::Registered(tunnel) => TunnelEvent::TunnelRegistered {
                tunnel: TunnelInfo::from(&tunnel),
            },
            TunnelUpdate::Unregistered(dns_name) => TunnelEvent::TunnelUnregistered { dns_name },
            TunnelUpdate::Degraded(tunnel) => TunnelEvent::TunnelDegraded {
                tunnel: TunnelInfo::from(&tunnel),
            },
        }
    }
}
