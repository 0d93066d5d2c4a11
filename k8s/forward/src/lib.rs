#![deny(missing_docs)]
//! This library forwards a local TCP port into a single kubernetes pod.
//!
//! The pod is either named explicitly or found via a label selector, directly amongst the
//! running pods or through the endpoints of a service. The bytes are tunneled through the
//! kubernetes api-server port-forward sub-resource.
//!
//! # Example
//! ```ignore
//! let selector = kube_portforward::LabelSelector::default().with_label("app", "etcd");
//! let spec = kube_portforward::ForwardSpec::service(2379)
//!     .with_selector(selector)
//!     .with_namespace("mayastor");
//!
//! let mut pf = kube_portforward::PortForward::new(spec).await?;
//! pf.start(Default::default()).await?;
//! tracing::info!(port = pf.listen_port(), "tunnel ready");
//! pf.stop();
//! ```

mod cluster;
mod error;
mod port_forward;
mod resolver;
mod selector;
mod tunnel;

#[cfg(test)]
pub(crate) mod test_utils;

/// Cluster and transport collaborators.
pub use cluster::{ClusterApi, Dialer, KubeCluster, PodDialer, Transport};
/// Errors returned by this crate.
pub use error::{Error, ResolveError, TunnelError};
/// The forward session.
pub use port_forward::{free_port, ForwardState, PortForward};
/// Target resolution.
pub use resolver::Resolver;
/// Label selection.
pub use selector::{LabelSelector, Operator, Requirement};
/// The local listener side of the tunnel.
pub use tunnel::{PortMapping, Tunnel};

/// The kubernetes api version used throughout the crate.
pub(crate) use k8s_openapi::api::core::v1 as vx;

/// The namespace used when none is specified.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The kind of resource which leads us to the target pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// The pod itself.
    Pod,
    /// A service, reached through one of its endpoints.
    Service,
}
impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Pod => write!(f, "pod"),
            ResourceType::Service => write!(f, "service"),
        }
    }
}

impl ResourceType {
    /// What gets listed when searching by labels.
    pub(crate) fn listed_as(&self) -> &'static str {
        match self {
            ResourceType::Pod => "pod",
            ResourceType::Service => "service endpoints",
        }
    }
}

/// A kubernetes namespace.
/// If None, the default is "default".
#[derive(Debug, Clone, Default)]
pub(crate) struct NameSpace(Option<String>);
impl NameSpace {
    /// Returns the configured namespace or the default.
    pub(crate) fn name_any(&self) -> &str {
        self.0.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

/// What to forward to and how.
/// The resource type is picked at construction and cannot change afterwards.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    resource: ResourceType,
    name: Option<String>,
    selector: LabelSelector,
    namespace: NameSpace,
    destination_port: u16,
    listen_port: u16,
}

impl ForwardSpec {
    /// Returns a new `Self` from the given parameters.
    /// # Arguments
    /// * `resource` - the kind of resource to look for
    /// * `destination_port` - the container port within the pod
    pub fn new(resource: ResourceType, destination_port: u16) -> Self {
        Self {
            resource,
            name: None,
            selector: LabelSelector::default(),
            namespace: NameSpace::default(),
            destination_port,
            listen_port: 0,
        }
    }
    /// Returns a new `Self` which forwards directly to a pod.
    pub fn pod(destination_port: u16) -> Self {
        Self::new(ResourceType::Pod, destination_port)
    }
    /// Returns a new `Self` which forwards to a pod backing a service.
    pub fn service(destination_port: u16) -> Self {
        Self::new(ResourceType::Service, destination_port)
    }

    /// Modify and return `Self` with the explicit pod name.
    /// An empty name is the same as no name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into()).filter(|name| !name.is_empty());
        self
    }

    /// Modify and return `Self` with the label selector.
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Modify and return `Self` with the namespace.
    /// An empty namespace is the same as the default one.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = NameSpace(Some(namespace.into()).filter(|ns| !ns.is_empty()));
        self
    }

    /// Modify and return `Self` with the local port to listen on.
    /// Port 0 picks a free port when the forward starts.
    pub fn with_listen_port(mut self, listen_port: u16) -> Self {
        self.listen_port = listen_port;
        self
    }

    /// The kind of resource we're looking for.
    pub fn resource(&self) -> ResourceType {
        self.resource
    }
    /// The explicit pod name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    /// The label selector.
    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }
    /// The configured namespace or the default.
    pub fn namespace(&self) -> &str {
        self.namespace.name_any()
    }
    /// The container port within the pod.
    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }
    /// The configured local port, 0 if it should be picked dynamically.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }
}
