//! HTTP route handlers for the tunnel API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::info;

use crate::tunnel::TunnelManager;

use super::types::{ErrorBody, TunnelEvent, TunnelInfo, TunnelSnapshot};

fn snapshot(manager: &TunnelManager) -> Vec<TunnelInfo> {
    manager.tunnels().into_iter().map(TunnelInfo::from).collect()
}

/// GET /tunnels - Returns registered tunnels as JSON.
pub async fn get_tunnels(State(manager): State<Arc<TunnelManager>>) -> Json<TunnelSnapshot> {
    Json(TunnelSnapshot {
        tunnels: snapshot(&manager),
    })
}

/// DELETE /tunnels/:dns_name - Unregisters one tunnel.
pub async fn delete_tunnel(
    State(manager): State<Arc<TunnelManager>>,
    Path(dns_name): Path<String>,
) -> Response {
    match manager.unregister_tunnel(&dns_name).await {
        Ok(()) => {
            info!("Unregistered {} via API", dns_name);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            let status = if e.is_not_found() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// GET /events - SSE endpoint for tunnel updates.
///
/// First message is a snapshot of all tunnels, then updates follow.
pub async fn events(
    State(manager): State<Arc<TunnelManager>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before the snapshot so no update falls in between.
    let rx = manager.subscribe();
    let snapshot_event = TunnelEvent::Snapshot {
        tunnels: snapshot(&manager),
    };

    let update_stream = BroadcastStream::new(rx).filter_map(|result| {
        result.ok().map(|update| {
            let event = TunnelEvent::from_update(update);
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().data(data))
        })
    });

    let snapshot_data = serde_json::to_string(&snapshot_event).unwrap_or_default();
    let initial_event =
        futures::stream::once(
            async move { Ok::<_, Infallible>(Event::default().data(snapshot_data)) },
        );

    Sse::new(initial_event.chain(update_stream)).keep_alive(KeepAlive::default())
}
