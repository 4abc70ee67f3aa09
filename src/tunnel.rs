//! Tunnel orchestration.
//!
//! A tunnel binds a DNS-style name to a forwarding session for one cluster
//! service. Registration walks a fixed sequence of steps:
//!
//! 1. Discover the service's HTTP port and a backing pod
//! 2. Reserve a local port and start the port-forward session
//! 3. Ensure the reverse proxy is serving and add the route
//! 4. Insert the tunnel into the registry
//! 5. Write the hosts entry
//!
//! Completed steps are recorded and undone in reverse order when a later
//! step fails, so a failed registration leaves nothing behind.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::hosts::HostsEditor;
use crate::k8s::{ClusterClient, KubeContext, PodInfo, ServiceInfo, ServicePort};
use crate::pipe::RelayStatsSnapshot;
use crate::portforward::{PortForwardEngine, SessionKey};
use crate::ports::PortAllocator;
use crate::proxy::RouteProxy;

pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Service ports treated as HTTP, in order of preference.
pub const HTTP_PORTS: [u16; 5] = [80, 8080, 3000, 8000, 9000];

pub const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Tunnel health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Active,
    /// Registered, but no live forwarding session backs it.
    Degraded,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Active => "active",
            TunnelState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub context: String,
    pub namespace: String,
    pub service: String,
    pub pod: String,
    pub dns_name: String,
    pub local_port: u16,
    /// Pod port the session forwards to.
    pub remote_port: u16,
    /// Service port the DNS name was derived from.
    pub service_port: u16,
    pub state: TunnelState,
}

impl Tunnel {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.context, &self.namespace, &self.pod, self.remote_port)
    }
}

/// A tunnel together with its session's traffic counters.
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub tunnel: Tunnel,
    pub stats: RelayStatsSnapshot,
}

/// Registry changes published to subscribers.
#[derive(Debug, Clone)]
pub enum TunnelUpdate {
    Registered(Tunnel),
    Unregistered(String),
    Degraded(Tunnel),
}

/// `svc.ns` for the default HTTP port, `svc:port.ns` otherwise.
pub fn build_dns_name(service: &str, namespace: &str, port: u16) -> String {
    if port == DEFAULT_HTTP_PORT {
        format!("{}.{}", service, namespace)
    } else {
        format!("{}:{}.{}", service, port, namespace)
    }
}

pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

/// Only in-cluster `ClusterIP` services with an allocated IP are tunneled;
/// node ports, load balancers and external names are reachable already.
pub fn is_eligible(service: &ServiceInfo) -> bool {
    ineligible_reason(service).is_none()
}

fn ineligible_reason(service: &ServiceInfo) -> Option<&'static str> {
    if service.service_type != "ClusterIP" {
        return Some("not a ClusterIP service");
    }
    match service.cluster_ip.as_deref() {
        None | Some("") => Some("no cluster IP"),
        Some("None") => Some("headless service"),
        Some(_) => None,
    }
}

pub fn pick_http_port(service: &ServiceInfo) -> Option<&ServicePort> {
    service.ports.iter().find(|p| HTTP_PORTS.contains(&p.port))
}

/// First running pod, else the first pod.
pub fn pick_pod(pods: &[PodInfo]) -> Option<&PodInfo> {
    pods.iter().find(|p| p.is_running()).or_else(|| pods.first())
}

/// Numeric target port, else the container port matching the service
/// port's name or number, else the pod's first container port.
pub fn resolve_pod_port(port: &ServicePort, pod: &PodInfo) -> Option<u16> {
    if let Some(target) = port.target_port {
        return Some(target);
    }

    pod.ports
        .iter()
        .find(|cp| {
            (port.name.is_some() && cp.name == port.name) || cp.container_port == port.port
        })
        .or_else(|| pod.ports.first())
        .map(|cp| cp.container_port)
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct TunnelManagerConfig {
    /// First local port probed for forwarding sessions.
    pub port_base: u16,
    /// Reverse proxy listening port.
    pub proxy_port: u16,
    /// Deadline for read-only listing calls.
    pub list_timeout: Duration,
    /// Deadline for discovery during registration.
    pub batch_timeout: Duration,
    /// Deadline for a session's readiness handshake.
    pub ready_timeout: Duration,
}

impl Default for TunnelManagerConfig {
    fn default() -> Self {
        Self {
            port_base: 40000,
            proxy_port: 80,
            list_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Discovery result for one service.
#[derive(Debug, Clone)]
struct TunnelPlan {
    context: String,
    namespace: String,
    service: String,
    pod: String,
    service_port: u16,
    remote_port: u16,
    dns_name: String,
}

/// A completed registration step that can be undone.
#[derive(Debug)]
enum Step {
    Session(SessionKey),
    Route(String),
    Registry(String),
    HostEntry(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Session(key) => write!(f, "port-forward {}", key),
            Step::Route(name) => write!(f, "route {}", name),
            Step::Registry(name) => write!(f, "registry entry {}", name),
            Step::HostEntry(name) => write!(f, "hosts entry {}", name),
        }
    }
}

/// Marks a DNS name as being registered; released on drop.
struct DnsClaim<'a> {
    pending: &'a DashSet<String>,
    name: String,
}

impl Drop for DnsClaim<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.name);
    }
}

async fn bounded<T, F>(deadline: Instant, step: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TunnelError::cluster(step, e)),
        Err(_) => Err(TunnelError::Timeout(step)),
    }
}

/// Owns the tunnel registry and drives the engine, proxy, and hosts file.
pub struct TunnelManager {
    cluster: Arc<dyn ClusterClient>,
    engine: PortForwardEngine,
    proxy: Arc<dyn RouteProxy>,
    hosts: Arc<dyn HostsEditor>,
    ports: PortAllocator,
    registry: DashMap<String, Tunnel>,
    pending: DashSet<String>,
    updates: broadcast::Sender<TunnelUpdate>,
    config: TunnelManagerConfig,
}

impl TunnelManager {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        proxy: Arc<dyn RouteProxy>,
        hosts: Arc<dyn HostsEditor>,
        config: TunnelManagerConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            engine: PortForwardEngine::new(Arc::clone(&cluster), config.ready_timeout),
            ports: PortAllocator::new(config.port_base),
            cluster,
            proxy,
            hosts,
            registry: DashMap::new(),
            pending: DashSet::new(),
            updates,
            config,
        }
    }

    /// Subscribe to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, update: TunnelUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }

    fn list_deadline(&self) -> Instant {
        Instant::now() + self.config.list_timeout
    }

    pub async fn list_contexts(&self) -> Result<Vec<KubeContext>> {
        bounded(
            self.list_deadline(),
            "list contexts",
            self.cluster.list_contexts(),
        )
        .await
    }

    pub async fn current_context(&self) -> Result<Option<String>> {
        bounded(
            self.list_deadline(),
            "read current context",
            self.cluster.current_context(),
        )
        .await
    }

    /// Non-system namespaces holding at least one eligible service.
    pub async fn namespaces_with_services(&self, context: &str) -> Result<Vec<String>> {
        let deadline = self.list_deadline();
        let mut namespaces = bounded(
            deadline,
            "list namespaces",
            self.cluster.list_namespaces(context),
        )
        .await?;
        namespaces.retain(|ns| !is_system_namespace(ns));
        namespaces.sort();

        let mut result = Vec::new();
        for ns in namespaces {
            let services = bounded(
                deadline,
                "list services",
                self.cluster.list_services(context, &ns),
            )
            .await?;
            if services.iter().any(is_eligible) {
                result.push(ns);
            }
        }
        Ok(result)
    }

    /// Eligible services in `namespace`, sorted by name.
    pub async fn list_services(&self, context: &str, namespace: &str) -> Result<Vec<ServiceInfo>> {
        let mut services = bounded(
            self.list_deadline(),
            "list services",
            self.cluster.list_services(context, namespace),
        )
        .await?;
        services.retain(is_eligible);
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    /// Registered tunnels sorted by DNS name.
    ///
    /// A tunnel whose session has ended on its own is reported as degraded.
    pub fn tunnels(&self) -> Vec<TunnelStatus> {
        let mut tunnels: Vec<TunnelStatus> = self
            .registry
            .iter()
            .map(|entry| {
                let mut tunnel = entry.value().clone();
                let stats = self.engine.stats(&tunnel.session_key());
                if stats.is_none() {
                    tunnel.state = TunnelState::Degraded;
                }
                TunnelStatus {
                    tunnel,
                    stats: stats.unwrap_or_default(),
                }
            })
            .collect();
        tunnels.sort_by(|a, b| a.tunnel.dns_name.cmp(&b.tunnel.dns_name));
        tunnels
    }

    pub fn tunnel(&self, dns_name: &str) -> Option<Tunnel> {
        self.registry.get(dns_name).map(|t| t.clone())
    }

    /// Registers one service.
    pub async fn register_tunnel(
        &self,
        context: &str,
        namespace: &str,
        service: &str,
    ) -> Result<Tunnel> {
        let deadline = Instant::now() + self.config.batch_timeout;
        let services = bounded(
            deadline,
            "list services",
            self.cluster.list_services(context, namespace),
        )
        .await?;
        let service = services
            .into_iter()
            .find(|s| s.name == service)
            .ok_or_else(|| TunnelError::ServiceNotFound {
                namespace: namespace.to_string(),
                service: service.to_string(),
            })?;

        let plan = self.plan_for_service(context, &service, deadline).await?;
        let _claim = self.claim(&plan.dns_name)?;
        let tunnel = self.open_session(&plan).await?;

        let mut steps = Vec::new();
        if let Err(e) = self.publish(&tunnel, &mut steps).await {
            warn!("Registering {} failed: {}", tunnel.dns_name, e);
            self.unwind(steps).await;
            return Err(e);
        }

        info!(
            "Registered http://{} -> {}/{} (pod {}:{}, local port {})",
            tunnel.dns_name,
            tunnel.namespace,
            tunnel.service,
            tunnel.pod,
            tunnel.remote_port,
            tunnel.local_port
        );
        self.notify(TunnelUpdate::Registered(tunnel.clone()));
        Ok(tunnel)
    }

    /// Registers every eligible service in every non-system namespace.
    ///
    /// Services whose discovery or session setup fails are skipped. A
    /// failure once a tunnel is being published (proxy, route, registry,
    /// hosts entry) rolls back every tunnel of the batch.
    pub async fn register_all_for_context(&self, context: &str) -> Result<Vec<Tunnel>> {
        let deadline = Instant::now() + self.config.batch_timeout;
        let namespaces = bounded(
            deadline,
            "list namespaces",
            self.cluster.list_namespaces(context),
        )
        .await?;

        let mut steps = Vec::new();
        let mut claims = Vec::new();
        let mut registered: Vec<Tunnel> = Vec::new();
        let mut skipped = 0usize;

        for ns in namespaces.iter().filter(|ns| !is_system_namespace(ns)) {
            let services = match bounded(
                deadline,
                "list services",
                self.cluster.list_services(context, ns),
            )
            .await
            {
                Ok(services) => services,
                Err(e) => {
                    warn!("Skipping namespace {}: {}", ns, e);
                    continue;
                }
            };

            for service in &services {
                if let Some(reason) = ineligible_reason(service) {
                    debug!("Skipping {}/{}: {}", ns, service.name, reason);
                    continue;
                }

                let plan = match self.plan_for_service(context, service, deadline).await {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!("Skipping {}/{}: {}", ns, service.name, e);
                        skipped += 1;
                        continue;
                    }
                };

                let claim = match self.claim(&plan.dns_name) {
                    Ok(claim) => claim,
                    Err(_) => {
                        debug!("{} is already registered", plan.dns_name);
                        continue;
                    }
                };

                let tunnel = match self.open_session(&plan).await {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        warn!("Skipping {}/{}: {}", ns, service.name, e);
                        skipped += 1;
                        continue;
                    }
                };

                if let Err(e) = self.publish(&tunnel, &mut steps).await {
                    warn!(
                        "Registering {} failed: {}, rolling back {} tunnel(s) of this batch",
                        tunnel.dns_name,
                        e,
                        registered.len() + 1
                    );
                    self.unwind(steps).await;
                    return Err(TunnelError::Batch {
                        service: format!("{}/{}", ns, service.name),
                        source: Box::new(e),
                    });
                }

                claims.push(claim);
                registered.push(tunnel);
            }
        }

        drop(claims);

        if registered.is_empty() {
            return Err(TunnelError::NoServicesRegistered(context.to_string()));
        }

        for tunnel in &registered {
            self.notify(TunnelUpdate::Registered(tunnel.clone()));
        }
        info!(
            "Registered {} tunnel(s) in context {} ({} skipped)",
            registered.len(),
            context,
            skipped
        );
        Ok(registered)
    }

    /// Removes a tunnel.
    ///
    /// If the hosts entry cannot be removed, the registry entry and route are
    /// restored but the session stays stopped; the tunnel is then reported as
    /// degraded until it is unregistered again. Nothing is restored when the
    /// name has been registered again in the meantime.
    pub async fn unregister_tunnel(&self, dns_name: &str) -> Result<()> {
        let (_, tunnel) = self
            .registry
            .remove(dns_name)
            .ok_or_else(|| TunnelError::TunnelNotFound(dns_name.to_string()))?;

        let key = tunnel.session_key();
        match self.engine.stop(&key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Port-forward for {} already gone", dns_name)
            }
            Err(e) => warn!("Failed to stop port-forward {}: {}", key, e),
        }

        self.proxy.remove_route(dns_name);

        if let Err(e) = self.hosts.remove_entry(dns_name).await {
            warn!(
                "Failed to remove hosts entry for {}: {}, restoring registration",
                dns_name, e
            );
            // A registration that started meanwhile owns the name.
            if self.pending.contains(dns_name) {
                return Err(e);
            }
            let mut degraded = tunnel;
            degraded.state = TunnelState::Degraded;
            match self.registry.entry(dns_name.to_string()) {
                Entry::Vacant(slot) => {
                    self.proxy.add_route(dns_name, degraded.local_port);
                    slot.insert(degraded.clone());
                }
                Entry::Occupied(_) => return Err(e),
            }
            self.notify(TunnelUpdate::Degraded(degraded));
            return Err(e);
        }

        info!("Unregistered {}", dns_name);
        self.notify(TunnelUpdate::Unregistered(dns_name.to_string()));
        Ok(())
    }

    /// Stops every session and the proxy, clears the managed hosts section,
    /// and empties the registry. Safe to call repeatedly.
    pub async fn cleanup(&self) -> Result<()> {
        for session in self.engine.active_sessions() {
            debug!(
                "Stopping port-forward {} on 127.0.0.1:{} ({} connections, {} bytes to pod, {} bytes back)",
                session.key,
                session.local_port,
                session.stats.total_connections,
                session.stats.bytes_to_pod,
                session.stats.bytes_to_local
            );
        }
        self.engine.stop_all();

        let mut first_error = None;
        if let Err(e) = self.proxy.stop().await {
            warn!("Failed to stop reverse proxy: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.hosts.clear_all_entries().await {
            warn!("Failed to clear hosts entries: {}", e);
            first_error.get_or_insert(e);
        }

        let names: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if self.registry.remove(&name).is_some() {
                self.notify(TunnelUpdate::Unregistered(name));
            }
        }

        info!("Cleanup complete");
        first_error.map_or(Ok(()), Err)
    }

    async fn plan_for_service(
        &self,
        context: &str,
        service: &ServiceInfo,
        deadline: Instant,
    ) -> Result<TunnelPlan> {
        if let Some(reason) = ineligible_reason(service) {
            return Err(TunnelError::Ineligible {
                namespace: service.namespace.clone(),
                service: service.name.clone(),
                reason,
            });
        }

        let port = pick_http_port(service).ok_or_else(|| TunnelError::NoHttpPort {
            namespace: service.namespace.clone(),
            service: service.name.clone(),
        })?;

        let pods = bounded(
            deadline,
            "find matching pods",
            self.cluster
                .find_pods_matching_selector(context, &service.namespace, &service.selector),
        )
        .await?;
        let pod = pick_pod(&pods).ok_or_else(|| TunnelError::NoMatchingPods {
            namespace: service.namespace.clone(),
            service: service.name.clone(),
        })?;

        let remote_port =
            resolve_pod_port(port, pod).ok_or_else(|| TunnelError::NoPodPort {
                namespace: service.namespace.clone(),
                service: service.name.clone(),
            })?;

        Ok(TunnelPlan {
            context: context.to_string(),
            namespace: service.namespace.clone(),
            service: service.name.clone(),
            pod: pod.name.clone(),
            service_port: port.port,
            remote_port,
            dns_name: build_dns_name(&service.name, &service.namespace, port.port),
        })
    }

    fn claim(&self, dns_name: &str) -> Result<DnsClaim<'_>> {
        let already = || TunnelError::AlreadyRegistered(dns_name.to_string());
        if self.registry.contains_key(dns_name) || !self.pending.insert(dns_name.to_string()) {
            return Err(already());
        }
        let claim = DnsClaim {
            pending: &self.pending,
            name: dns_name.to_string(),
        };
        // A concurrent registration may have finished between the checks.
        if self.registry.contains_key(dns_name) {
            return Err(already());
        }
        Ok(claim)
    }

    /// Picks a local port and starts the session for `plan`.
    async fn open_session(&self, plan: &TunnelPlan) -> Result<Tunnel> {
        let tunnel = Tunnel {
            context: plan.context.clone(),
            namespace: plan.namespace.clone(),
            service: plan.service.clone(),
            pod: plan.pod.clone(),
            dns_name: plan.dns_name.clone(),
            local_port: 0,
            remote_port: plan.remote_port,
            service_port: plan.service_port,
            state: TunnelState::Active,
        };

        let mut used = self.engine.used_ports();
        used.extend(self.registry.iter().map(|e| e.local_port));
        let reservation = self.ports.reserve(&used)?;

        self.engine
            .start(tunnel.session_key(), reservation.port())
            .await?;

        Ok(Tunnel {
            local_port: reservation.port(),
            ..tunnel
        })
    }

    /// Makes a started tunnel reachable, recording each completed step.
    async fn publish(&self, tunnel: &Tunnel, steps: &mut Vec<Step>) -> Result<()> {
        let name = &tunnel.dns_name;
        steps.push(Step::Session(tunnel.session_key()));

        self.proxy
            .start_if_not_running(self.config.proxy_port)
            .await?;
        self.proxy.add_route(name, tunnel.local_port);
        steps.push(Step::Route(name.clone()));

        self.registry.insert(name.clone(), tunnel.clone());
        steps.push(Step::Registry(name.clone()));

        self.hosts.add_entry(name).await?;
        steps.push(Step::HostEntry(name.clone()));
        Ok(())
    }

    /// Undoes completed steps, newest first. Failures are logged and skipped.
    async fn unwind(&self, steps: Vec<Step>) {
        for step in steps.into_iter().rev() {
            match &step {
                Step::HostEntry(name) => {
                    if let Err(e) = self.hosts.remove_entry(name).await {
                        warn!("Rollback: failed to remove {}: {}", step, e);
                        continue;
                    }
                }
                Step::Registry(name) => {
                    self.registry.remove(name);
                }
                Step::Route(name) => self.proxy.remove_route(name),
                Step::Session(key) => {
                    if let Err(e) = self.engine.stop(key) {
                        if !e.is_not_found() {
                            warn!("Rollback: failed to stop {}: {}", step, e);
                            continue;
                        }
                    }
                }
            }
            warn!("Rolled back {}", step);
        }
    }
}
