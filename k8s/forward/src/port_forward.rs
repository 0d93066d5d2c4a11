use crate::{
    error::{self, Error, TunnelError},
    ClusterApi, ForwardSpec, KubeCluster, PortMapping, ResolveError, Resolver, Transport, Tunnel,
};
use rand::{rngs::StdRng, Rng};
use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The lifecycle of a `PortForward`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    /// Not started yet.
    Created,
    /// Resolving the target and bringing up the tunnel.
    Starting,
    /// The tunnel is usable.
    Ready,
    /// The tunnel could not be brought up, or it failed after it was up.
    Failed,
    /// The tunnel was stopped.
    Stopped,
}

/// Used to port forward a local port into a single kubernetes pod.
///
/// A session is started at most once; to retry, build a new one. Dropping the session
/// also stops the tunnel.
/// # Example
/// ```ignore
/// let spec = kube_portforward::ForwardSpec::pod(2379).with_name("etcd-0");
/// let mut pf = kube_portforward::PortForward::new(spec).await?;
///
/// pf.start(Default::default()).await?;
/// tracing::info!(port = pf.listen_port(), "Started tunnel");
/// pf.stop();
/// pf.wait().await?;
/// ```
pub struct PortForward<C = KubeCluster, T = KubeCluster, R = StdRng> {
    spec: ForwardSpec,
    resolver: Resolver<C, R>,
    transport: T,
    state: ForwardState,
    listen_port: Option<u16>,
    pod_name: Option<String>,
    stop: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<Result<(), TunnelError>>>,
}

impl PortForward {
    /// Return a new `Self`, with a kubernetes client from the default configuration.
    pub async fn new(spec: ForwardSpec) -> Result<Self, Error> {
        let cluster = KubeCluster::try_default().await?;
        Ok(Self::with_clients(spec, cluster.clone(), cluster))
    }
    /// Return a new `Self`, with a kubernetes client from the given kubeconfig file,
    /// or the default configuration.
    pub async fn from_kubeconfig(
        spec: ForwardSpec,
        kube_config_path: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let cluster = KubeCluster::from_kubeconfig(kube_config_path).await?;
        Ok(Self::with_clients(spec, cluster.clone(), cluster))
    }
}

impl<C: ClusterApi, T: Transport> PortForward<C, T> {
    /// Return a new `Self` using the given collaborators.
    /// # Arguments
    /// * `spec` - what to forward to
    /// * `api` - used to find the target pod
    /// * `transport` - used to dial the target pod
    pub fn with_clients(spec: ForwardSpec, api: C, transport: T) -> Self {
        Self::with_resolver(spec, Resolver::new(api), transport)
    }
}

impl<C: ClusterApi, T: Transport, R: Rng + Send> PortForward<C, T, R> {
    /// Return a new `Self` using the given resolver and transport.
    pub fn with_resolver(spec: ForwardSpec, resolver: Resolver<C, R>, transport: T) -> Self {
        Self {
            spec,
            resolver,
            transport,
            state: ForwardState::Created,
            listen_port: None,
            pod_name: None,
            stop: None,
            done: None,
        }
    }

    /// The forward specification.
    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }
    /// The current state.
    pub fn state(&self) -> ForwardState {
        self.state
    }
    /// The local port, once the session has started.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }
    /// The target pod, once it has been resolved.
    pub fn pod_name(&self) -> Option<&str> {
        self.pod_name.as_deref()
    }

    /// Start the port forward, returning once the tunnel is ready for use.
    /// Cancelling the token stops the tunnel and fails the start, unless it's already ready.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        ensure!(
            self.state == ForwardState::Created,
            error::AlreadyStarted { state: self.state }
        );
        self.state = ForwardState::Starting;

        match self.launch(cancel).await {
            Ok(()) => {
                self.state = ForwardState::Ready;
                tracing::info!(
                    pod_name = self.pod_name(),
                    local_port = self.listen_port,
                    pod_port = self.spec.destination_port(),
                    "Port forward ready"
                );
                Ok(())
            }
            Err(error) => {
                self.state = ForwardState::Failed;
                tracing::error!(%error, "Failed to start port forward");
                Err(error)
            }
        }
    }

    async fn launch(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        let resource = self.spec.resource();
        let listen_port = self.pick_listen_port().context(error::PortBind)?;

        let pod_name = tokio::select! {
            biased;
            _ = cancel.cancelled() => return error::Cancelled.fail(),
            pod_name = self.resource_name() => pod_name.context(error::Resolve { resource })?,
        };

        let dialer = self
            .transport
            .dialer(self.spec.namespace(), &pod_name)
            .context(error::CreateDialer)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let ports = [PortMapping::new(listen_port, self.spec.destination_port()).to_string()];
        let tunnel = Tunnel::new(dialer, &ports, stop_rx, ready_tx)
            .context(error::CreateTunnel { resource })?;

        tracing::debug!(%pod_name, ports = ?ports, "Starting port forward");
        tokio::spawn(async move {
            // the session may be gone, in which case nobody cares about the result
            done_tx.send(tunnel.run().await).ok();
        });
        self.stop = Some(stop_tx);

        tokio::select! {
            biased;
            ready = ready_rx => match ready {
                Ok(()) => {
                    self.done = Some(done_rx);
                    Ok(())
                }
                // the tunnel went away without signalling, so it must have a result for us
                Err(_) => Err(Self::not_ready(done_rx.await)),
            },
            result = &mut done_rx => Err(Self::not_ready(result)),
            _ = cancel.cancelled() => {
                self.send_stop();
                // lets `wait` observe the worker exiting
                self.done = Some(done_rx);
                error::Cancelled.fail()
            }
        }
    }

    fn not_ready(result: Result<Result<(), TunnelError>, oneshot::error::RecvError>) -> Error {
        let source = match result {
            Ok(Err(error)) => error,
            Ok(Ok(())) => TunnelError::NotReady,
            Err(_) => TunnelError::WorkerGone,
        };
        Error::Forward { source }
    }

    /// Stop the port forward.
    /// Only a ready forward is stopped, any other state is left as is.
    pub fn stop(&mut self) {
        match self.state {
            ForwardState::Ready => {
                self.send_stop();
                self.state = ForwardState::Stopped;
                tracing::debug!(pod_name = self.pod_name(), "Port forward stopped");
            }
            state => {
                tracing::debug!(?state, "Port forward is not running, nothing to stop");
            }
        }
    }

    fn send_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // the tunnel may have already exited
            stop.send(()).ok();
        }
    }

    /// Wait for the tunnel to terminate, either because it was stopped or because it failed.
    /// Returns immediately if the tunnel was never spawned or has already been waited on.
    pub async fn wait(&mut self) -> Result<(), Error> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };
        let source = match done.await {
            Ok(Ok(())) => {
                if self.state == ForwardState::Ready {
                    self.state = ForwardState::Stopped;
                }
                return Ok(());
            }
            Ok(Err(error)) => error,
            Err(_) => TunnelError::WorkerGone,
        };
        self.state = ForwardState::Failed;
        Err(Error::Terminated { source })
    }

    /// Returns the port the port forward should listen on.
    /// The configured port is used if set, otherwise a free port is found.
    /// Either way, the result is kept for the lifetime of the session.
    pub(crate) fn pick_listen_port(&mut self) -> std::io::Result<u16> {
        if let Some(port) = self.listen_port {
            return Ok(port);
        }
        let port = match self.spec.listen_port() {
            0 => free_port()?,
            port => port,
        };
        self.listen_port = Some(port);
        Ok(port)
    }

    /// Returns the name of the pod to forward to, resolving it on first use.
    pub(crate) async fn resource_name(&mut self) -> Result<String, ResolveError> {
        if let Some(name) = &self.pod_name {
            return Ok(name.clone());
        }
        let name = self.resolver.resolve(&self.spec).await?;
        self.pod_name = Some(name.clone());
        Ok(name)
    }
}

/// Get a free local port by binding to port 0, checking the bound port number, and then
/// closing the socket.
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
