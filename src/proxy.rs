//! Host-header routing reverse proxy.
//!
//! One loopback listener serves every tunnel. The `Host` header picks the
//! route; the request is then forwarded unchanged to the tunnel's local
//! port-forward listener.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HOST, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use dashmap::DashMap;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TunnelError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Route management for the shared reverse proxy.
#[async_trait]
pub trait RouteProxy: Send + Sync {
    /// Binds the listener on `port` unless it is already serving.
    async fn start_if_not_running(&self, port: u16) -> Result<()>;

    fn add_route(&self, host: &str, local_port: u16);

    fn add_routes(&self, routes: &HashMap<String, u16>);

    fn remove_route(&self, host: &str);

    fn routes(&self) -> HashMap<String, u16>;

    /// Stops the listener and clears all routes.
    async fn stop(&self) -> Result<()>;
}

/// Host name to local port mapping.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, u16>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, port: u16) {
        self.routes.insert(host.to_string(), port);
    }

    pub fn remove(&self, host: &str) -> Option<u16> {
        self.routes.remove(host).map(|(_, port)| port)
    }

    /// Exact match first, then the host with a trailing `:port` removed.
    pub fn lookup(&self, host: &str) -> Option<u16> {
        if let Some(port) = self.routes.get(host) {
            return Some(*port);
        }
        strip_port(host).and_then(|bare| self.routes.get(bare).map(|p| *p))
    }

    pub fn snapshot(&self) -> HashMap<String, u16> {
        self.routes
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn clear(&self) {
        self.routes.clear();
    }
}

/// Drops a trailing `:<digits>` suffix. `svc:8080.ns` has no such suffix.
fn strip_port(host: &str) -> Option<&str> {
    let (bare, port) = host.rsplit_once(':')?;
    if bare.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(bare)
}

struct ProxyState {
    routes: Arc<RouteTable>,
    client: Client<HttpConnector, Body>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The reverse proxy server.
pub struct ReverseProxy {
    routes: Arc<RouteTable>,
    server: Mutex<Option<RunningServer>>,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxy {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RouteTable::new()),
            server: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    fn router(&self) -> Router {
        let state = Arc::new(ProxyState {
            routes: Arc::clone(&self.routes),
            client: Client::builder(TokioExecutor::new()).build_http::<Body>(),
        });

        Router::new().fallback(forward).with_state(state)
    }
}

#[async_trait]
impl RouteProxy for ReverseProxy {
    async fn start_if_not_running(&self, port: u16) -> Result<()> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.as_ref() {
            if port != 0 && running.addr.port() != port {
                warn!(
                    "Proxy already listening on {}, ignoring port {}",
                    running.addr, port
                );
            }
            return Ok(());
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| TunnelError::Proxy(format!("bind 127.0.0.1:{}: {}", port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TunnelError::Proxy(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Reverse proxy error: {}", e);
            }
        });

        info!("Reverse proxy listening on http://{}", addr);
        *server = Some(RunningServer {
            addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    fn add_route(&self, host: &str, local_port: u16) {
        self.routes.insert(host, local_port);
        debug!("Route added: {} -> 127.0.0.1:{}", host, local_port);
    }

    fn add_routes(&self, routes: &HashMap<String, u16>) {
        for (host, port) in routes {
            self.add_route(host, *port);
        }
    }

    fn remove_route(&self, host: &str) {
        if self.routes.remove(host).is_some() {
            debug!("Route removed: {}", host);
        }
    }

    fn routes(&self) -> HashMap<String, u16> {
        self.routes.snapshot()
    }

    async fn stop(&self) -> Result<()> {
        let running = self.server.lock().await.take();
        self.routes.clear();

        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("Reverse proxy did not drain in time, aborting");
            task.abort();
        }

        info!("Reverse proxy on {} stopped", running.addr);
        Ok(())
    }
}

/// `Host` header, else the request authority, else empty.
fn request_host(req: &Request) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

async fn forward(State(state): State<Arc<ProxyState>>, mut req: Request) -> Response {
    let host = request_host(&req);

    let Some(port) = state.routes.lookup(&host) else {
        debug!("No route for host {}", host);
        return (
            StatusCode::NOT_FOUND,
            format!("no route found for host: {}", host),
        )
            .into_response();
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target: Uri = match format!("http://127.0.0.1:{}{}", port, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid request uri: {}", e))
                .into_response()
        }
    };

    debug!("{} {}{} -> {}", req.method(), host, path_and_query, target);
    *req.uri_mut() = target;

    match state.client.request(req).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!("Upstream error for {}: {}", host, e);
            (StatusCode::BAD_GATEWAY, format!("upstream error: {}", e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::http::HeaderMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("svc.ns:9090"), Some("svc.ns"));
        assert_eq!(strip_port("svc:8080.ns"), None);
        assert_eq!(strip_port("svc:8080.ns:80"), Some("svc:8080.ns"));
        assert_eq!(strip_port("svc.ns"), None);
        assert_eq!(strip_port("svc.ns:"), None);
        assert_eq!(strip_port(":80"), None);
    }

    #[test]
    fn test_lookup_fallback() {
        let table = RouteTable::new();
        table.insert("svc.ns", 40000);
        table.insert("api:8080.ns", 40001);

        assert_eq!(table.lookup("svc.ns"), Some(40000));
        assert_eq!(table.lookup("svc.ns:9090"), Some(40000));
        assert_eq!(table.lookup("api:8080.ns"), Some(40001));
        assert_eq!(table.lookup("api:8080.ns:80"), Some(40001));
        assert_eq!(table.lookup("api.ns:8080"), None);
        assert_eq!(table.lookup("other.ns"), None);
    }

    #[test]
    fn test_composite_key_needs_exact_route() {
        let table = RouteTable::new();
        table.insert("svc.ns", 40000);
        assert_eq!(table.lookup("svc:8080.ns"), None);
    }

    async fn backend() -> u16 {
        async fn echo(headers: HeaderMap, uri: Uri) -> String {
            let host = headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            format!("host={} uri={}", host, uri)
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/*path", get(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn send_raw(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn send(port: u16, host: &str, path: &str) -> String {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        send_raw(port, &request).await
    }

    #[tokio::test]
    async fn test_proxy_routes_by_host() {
        let backend_port = backend().await;
        let proxy = ReverseProxy::new();
        proxy.start_if_not_running(0).await.unwrap();
        let proxy_port = proxy.local_addr().await.unwrap().port();

        proxy.add_route("web.default", backend_port);

        let response = send(proxy_port, "web.default", "/hello?x=1").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("host=web.default uri=/hello?x=1"), "{}", response);

        // Port suffix falls back to the bare host route.
        let response = send(proxy_port, "web.default:9090", "/hi").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("host=web.default:9090"), "{}", response);

        let response = send(proxy_port, "missing.default", "/").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
        assert!(response.contains("no route found for host: missing.default"));

        let response = send_raw(proxy_port, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(response.contains(" 404 "), "{}", response);
        assert!(response.contains("no route found for host: "), "{}", response);

        proxy.stop().await.unwrap();
        assert!(!proxy.is_running().await);
        assert!(proxy.routes().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let closed = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let proxy = ReverseProxy::new();
        proxy.start_if_not_running(0).await.unwrap();
        let proxy_port = proxy.local_addr().await.unwrap().port();
        proxy.add_route("gone.default", closed);

        let response = send(proxy_port, "gone.default", "/").await;
        assert!(response.starts_with("HTTP/1.1 502"), "{}", response);

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_clears() {
        let proxy = ReverseProxy::new();
        proxy.start_if_not_running(0).await.unwrap();
        let addr = proxy.local_addr().await.unwrap();
        proxy.start_if_not_running(0).await.unwrap();
        assert_eq!(proxy.local_addr().await, Some(addr));

        let mut routes = HashMap::new();
        routes.insert("a.ns".to_string(), 40000);
        routes.insert("b.ns".to_string(), 40001);
        proxy.add_routes(&routes);
        assert_eq!(proxy.routes(), routes);

        proxy.remove_route("a.ns");
        proxy.remove_route("a.ns");
        assert_eq!(proxy.routes().len(), 1);

        proxy.stop().await.unwrap();
        proxy.stop().await.unwrap();
        assert!(proxy.routes().is_empty());
    }
}
