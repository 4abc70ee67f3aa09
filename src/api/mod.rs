//! HTTP API for exposing tunnel state.
//!
//! This module provides a small REST API and a Server-Sent Events (SSE)
//! endpoint for listing, removing, and watching tunnels while `up` runs.

mod handlers;
mod types;

use axum::{
    routing::{delete, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::tunnel::TunnelManager;

pub fn router(manager: Arc<TunnelManager>) -> Router {
    Router::new()
        .route("/tunnels", get(handlers::get_tunnels))
        .route("/tunnels/:dns_name", delete(handlers::delete_tunnel))
        .route("/events", get(handlers::events))
        .with_state(manager)
}

/// Starts the HTTP API server on the loopback interface.
///
/// Runs until the task is dropped or the listener fails.
pub async fn start_server(port: u16, manager: Arc<TunnelManager>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!("API server listening on http://{}", addr);

    axum::serve(listener, router(manager)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostsFile;
    use crate::k8s::{BoxedStream, ClusterClient, KubeContext, PodInfo, ServiceInfo};
    use crate::proxy::ReverseProxy;
    use crate::tunnel::TunnelManagerConfig;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct EmptyCluster;

    #[async_trait]
    impl ClusterClient for EmptyCluster {
        async fn list_contexts(&self) -> anyhow::Result<Vec<KubeContext>> {
            Ok(vec![])
        }
        async fn current_context(&self) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn list_namespaces(&self, _: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_services(&self, _: &str, _: &str) -> anyhow::Result<Vec<ServiceInfo>> {
            Ok(vec![])
        }
        async fn find_pods_matching_selector(
            &self,
            _: &str,
            _: &str,
            _: &BTreeMap<String, String>,
        ) -> anyhow::Result<Vec<PodInfo>> {
            Ok(vec![])
        }
        async fn open_port_forward_stream(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: u16,
        ) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("no pods")
        }
    }

    async fn request(port: u16, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            method, path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = Arc::new(TunnelManager::new(
            Arc::new(EmptyCluster),
            Arc::new(ReverseProxy::new()),
            Arc::new(HostsFile::new(dir.path().join("hosts"))),
            TunnelManagerConfig::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = router(manager);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = request(port, "GET", "/tunnels").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains(r#"{"tunnels":[]}"#), "{}", response);

        let response = request(port, "DELETE", "/tunnels/web.default").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
        assert!(response.contains("tunnel not found: web.default"), "{}", response);
    }
}
