use crate::{port_forward::ForwardState, ResourceType};
use snafu::Snafu;

/// Errors which can occur while bringing up or running a port forward.
/// Each variant identifies the stage which failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// Failed to create the kubernetes client.
    #[snafu(display("could not create kubernetes client: {}", source))]
    Config {
        /// The kube client error.
        source: kube::Error,
    },
    /// Failed to load the given kubeconfig file.
    #[snafu(display("could not load kubernetes configuration file: {}", source))]
    Kubeconfig {
        /// The kubeconfig error.
        source: kube::config::KubeconfigError,
    },
    /// Failed to find a free local port.
    #[snafu(display("could not find a port to bind to: {}", source))]
    PortBind {
        /// The socket error.
        source: std::io::Error,
    },
    /// Failed to resolve the target pod.
    #[snafu(display("could not get {} name: {}", resource, source))]
    Resolve {
        /// The kind of resource being resolved.
        resource: ResourceType,
        /// Why the resolution failed.
        source: ResolveError,
    },
    /// Failed to build the dialer for the target pod.
    #[snafu(display("could not create a dialer: {}", source))]
    CreateDialer {
        /// The transport error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Failed to set up the tunnel.
    #[snafu(display("could not port forward into {}: {}", resource, source))]
    CreateTunnel {
        /// The kind of resource being forwarded into.
        resource: ResourceType,
        /// The tunnel setup error.
        source: TunnelError,
    },
    /// The tunnel failed before it became ready.
    #[snafu(display("could not create port forward: {}", source))]
    Forward {
        /// The tunnel error.
        source: TunnelError,
    },
    /// The tunnel failed after it became ready.
    #[snafu(display("port forward terminated: {}", source))]
    Terminated {
        /// The tunnel error.
        source: TunnelError,
    },
    /// The start was cancelled before the tunnel became ready.
    #[snafu(display("port forward cancelled before becoming ready"))]
    Cancelled,
    /// A session may only be started once.
    #[snafu(display("port forward already started, current state: {:?}", state))]
    AlreadyStarted {
        /// The state of the session when start was called.
        state: ForwardState,
    },
}

/// Errors returned when resolving the target pod.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ResolveError {
    /// Neither a name nor any label was given.
    #[snafu(display("no {} labels specified", resource))]
    NoSelector {
        /// The kind of resource being resolved.
        resource: ResourceType,
    },
    /// The label selector is malformed.
    #[snafu(display("invalid label selector: {}", reason))]
    InvalidSelector {
        /// What's wrong with the selector.
        reason: String,
    },
    /// The kubernetes list request failed.
    #[snafu(display("listing {} in kubernetes: {}", kind, source))]
    List {
        /// The kind of object being listed.
        kind: &'static str,
        /// The kube client error.
        source: kube::Error,
    },
    /// Nothing matches the selector.
    #[snafu(display(
        "could not find running {} for selector: labels \"{}\"",
        resource.listed_as(),
        selector
    ))]
    NotFound {
        /// The kind of resource being resolved.
        resource: ResourceType,
        /// The canonical label selector.
        selector: String,
    },
    /// More than one pod matches the selector.
    #[snafu(display(
        "ambiguous {}: found more than one {} for selector: labels \"{}\"",
        resource,
        resource,
        selector
    ))]
    Ambiguous {
        /// The kind of resource being resolved.
        resource: ResourceType,
        /// The canonical label selector.
        selector: String,
    },
    /// The chosen endpoint has no address backed by a pod.
    #[snafu(display("could not find any pods attached to endpoint {}", endpoint))]
    NoBackingPod {
        /// The endpoints object name.
        endpoint: String,
    },
}

/// Errors from the local side of the tunnel.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum TunnelError {
    /// No port mapping was given.
    #[snafu(display("at least 1 port must be specified"))]
    NoPorts,
    /// A port mapping could not be parsed.
    #[snafu(display("error parsing port mapping '{}': {}", mapping, source))]
    InvalidPort {
        /// The port mapping as given.
        mapping: String,
        /// The parse error.
        source: std::num::ParseIntError,
    },
    /// The remote port of a mapping is 0.
    #[snafu(display("remote port must be > 0 in port mapping '{}'", mapping))]
    ZeroRemotePort {
        /// The port mapping as given.
        mapping: String,
    },
    /// Failed to listen on the local address.
    #[snafu(display("unable to listen on {}: {}", address, source))]
    Listen {
        /// The local address.
        address: std::net::SocketAddr,
        /// The socket error.
        source: std::io::Error,
    },
    /// The pod did not accept a stream on the remote port.
    #[snafu(display("unable to connect to pod port {}: {}", pod_port, source))]
    Connect {
        /// The remote pod port.
        pod_port: u16,
        /// The dialer error.
        #[snafu(source(from(anyhow::Error, Into::into)))]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Failed to accept a local connection.
    #[snafu(display("failed to accept connection: {}", source))]
    Accept {
        /// The socket error.
        source: std::io::Error,
    },
    /// The tunnel completed without ever becoming ready.
    #[snafu(display("tunnel closed before becoming ready"))]
    NotReady,
    /// The tunnel task went away without reporting its result.
    #[snafu(display("tunnel worker exited without reporting a result"))]
    WorkerGone,
}
