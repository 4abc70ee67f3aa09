//! Kubernetes client, discovery, and port-forward streams.
//!
//! This module is the boundary to the cluster API:
//! - Context listing from the kubeconfig
//! - Namespace, service, and pod discovery per context
//! - Opening port-forward streams to a pod
//!
//! Everything here is plain I/O. Filtering and selection policy lives in the
//! tunnel orchestrator so it can be exercised against a fake client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// A bidirectional byte stream to a pod port.
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ForwardStream>;

/// A context entry from the kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeContext {
    pub name: String,
    pub cluster: String,
    pub namespace: Option<String>,
}

/// A port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    /// Numeric target port; named target ports are resolved against the pod.
    pub target_port: Option<u16>,
}

/// Information about a discovered Kubernetes service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    /// `ClusterIP`, `NodePort`, `LoadBalancer`, or `ExternalName`.
    pub service_type: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePort>,
    pub selector: BTreeMap<String, String>,
}

/// A container port declared by a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub container_port: u16,
}

/// A pod that can be forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: Option<String>,
    pub ports: Vec<ContainerPort>,
}

impl PodInfo {
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// The read operations and stream capability the orchestrator needs from a cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<KubeContext>>;

    async fn current_context(&self) -> Result<Option<String>>;

    async fn list_namespaces(&self, context: &str) -> Result<Vec<String>>;

    async fn list_services(&self, context: &str, namespace: &str) -> Result<Vec<ServiceInfo>>;

    async fn find_pods_matching_selector(
        &self,
        context: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>>;

    /// Upgrades a connection to the pod's port-forward sub-resource and
    /// returns the stream for `port`.
    async fn open_port_forward_stream(
        &self,
        context: &str,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxedStream>;
}

/// Kubernetes client backed by a kubeconfig, with one API client per context.
pub struct K8sClient {
    kubeconfig: Kubeconfig,
    /// Clients are built lazily and reused for every call on the same context.
    clients: DashMap<String, Client>,
}

impl K8sClient {
    /// Loads the kubeconfig from `path`, or from `KUBECONFIG` / `~/.kube/config`.
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to load kubeconfig from {}", path.display()))?,
            None => Kubeconfig::read().context(
                "Failed to load kubeconfig. Is KUBECONFIG set or ~/.kube/config present?",
            )?,
        };

        Ok(Self {
            kubeconfig,
            clients: DashMap::new(),
        })
    }

    async fn client(&self, context: &str) -> Result<Client> {
        if let Some(client) = self.clients.get(context) {
            return Ok(client.clone());
        }

        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            cluster: None,
            user: None,
        };
        let config = Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options)
            .await
            .with_context(|| format!("Failed to load Kubernetes config for context '{}'", context))?;

        info!("Connecting to Kubernetes cluster: {}", config.cluster_url);

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        self.clients.insert(context.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ClusterClient for K8sClient {
    async fn list_contexts(&self) -> Result<Vec<KubeContext>> {
        let mut contexts: Vec<KubeContext> = self
            .kubeconfig
            .contexts
            .iter()
            .map(|named| KubeContext {
                name: named.name.clone(),
                cluster: named
                    .context
                    .as_ref()
                    .map(|c| c.cluster.clone())
                    .unwrap_or_default(),
                namespace: named.context.as_ref().and_then(|c| c.namespace.clone()),
            })
            .collect();

        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(contexts)
    }

    async fn current_context(&self) -> Result<Option<String>> {
        Ok(self.kubeconfig.current_context.clone())
    }

    async fn list_namespaces(&self, context: &str) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client(context).await?);
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list namespaces")?;

        Ok(list
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn list_services(&self, context: &str, namespace: &str) -> Result<Vec<ServiceInfo>> {
        let api: Api<Service> = Api::namespaced(self.client(context).await?, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list services in namespace {}", namespace))?;

        let services: Vec<ServiceInfo> = list
            .into_iter()
            .map(|svc| {
                let spec = svc.spec.unwrap_or_default();
                let ports = spec
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| ServicePort {
                        name: p.name,
                        port: p.port as u16,
                        target_port: match p.target_port {
                            Some(IntOrString::Int(port)) if port > 0 => Some(port as u16),
                            _ => None,
                        },
                    })
                    .collect();

                ServiceInfo {
                    name: svc.metadata.name.unwrap_or_default(),
                    namespace: namespace.to_string(),
                    service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
                    cluster_ip: spec.cluster_ip,
                    ports,
                    selector: spec.selector.unwrap_or_default(),
                }
            })
            .collect();

        debug!("Discovered {} services in {}", services.len(), namespace);
        Ok(services)
    }

    async fn find_pods_matching_selector(
        &self,
        context: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>> {
        if selector.is_empty() {
            return Ok(Vec::new());
        }

        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let api: Api<Pod> = Api::namespaced(self.client(context).await?, namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector))
            .await
            .with_context(|| {
                format!(
                    "Failed to list pods with selector {} in namespace {}",
                    label_selector, namespace
                )
            })?;

        Ok(pods
            .into_iter()
            .map(|pod| {
                let ports = pod
                    .spec
                    .as_ref()
                    .map(|spec| {
                        spec.containers
                            .iter()
                            .flat_map(|c| c.ports.iter().flatten())
                            .map(|p| ContainerPort {
                                name: p.name.clone(),
                                container_port: p.container_port as u16,
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                PodInfo {
                    name: pod.metadata.name.unwrap_or_default(),
                    namespace: namespace.to_string(),
                    phase: pod.status.and_then(|s| s.phase),
                    ports,
                }
            })
            .collect())
    }

    async fn open_port_forward_stream(
        &self,
        context: &str,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxedStream> {
        debug!("Port-forwarding to {}/{} port {}", namespace, pod, port);

        let api: Api<Pod> = Api::namespaced(self.client(context).await?, namespace);
        let mut pf = api.portforward(pod, &[port]).await.with_context(|| {
            format!(
                "Failed to establish port-forward to {}/{}:{}",
                namespace, pod, port
            )
        })?;

        let stream = pf
            .take_stream(port)
            .ok_or_else(|| anyhow!("Failed to get port-forward stream"))?;

        // The forwarder drives the websocket until the stream is dropped.
        tokio::spawn(async move {
            if let Err(e) = pf.join().await {
                debug!("Port-forward ended: {}", e);
            }
        });

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_running() {
        let mut pod = PodInfo {
            name: "web-0".to_string(),
            namespace: "default".to_string(),
            phase: Some("Pending".to_string()),
            ports: vec![],
        };
        assert!(!pod.is_running());

        pod.phase = Some("Running".to_string());
        assert!(pod.is_running());
    }

    #[tokio::test]
    async fn test_boxed_duplex_is_forward_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, mut b) = tokio::io::duplex(64);
        let mut boxed: BoxedStream = Box::new(a);

        boxed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
