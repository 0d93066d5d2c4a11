use crate::{
    error::{Accept, Connect, InvalidPort, Listen, NoPorts, TunnelError, ZeroRemotePort},
    Dialer,
};
use futures::StreamExt;
use snafu::{ensure, ResultExt};
use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_stream::wrappers::TcpListenerStream;

/// A local port forwarded to a remote pod port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    local: u16,
    remote: u16,
}

impl PortMapping {
    /// Returns a new `Self`.
    /// A `local` port of 0 lets the kernel pick the next free port.
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
    /// The local port.
    pub fn local(&self) -> u16 {
        self.local
    }
    /// The remote pod port.
    pub fn remote(&self) -> u16 {
        self.remote
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Parses `"8888:5000"`, `":5000"` (any local port) or `"5000"` (same local port).
impl FromStr for PortMapping {
    type Err = TunnelError;

    fn from_str(mapping: &str) -> Result<Self, Self::Err> {
        let (local, remote) = match mapping.split_once(':') {
            Some(("", remote)) => ("0", remote),
            Some((local, remote)) => (local, remote),
            None => (mapping, mapping),
        };
        let local = local.parse::<u16>().context(InvalidPort { mapping })?;
        let remote = remote.parse::<u16>().context(InvalidPort { mapping })?;
        ensure!(remote != 0, ZeroRemotePort { mapping });

        Ok(Self::new(local, remote))
    }
}

/// The local side of a port forward.
///
/// Listens on the loopback address for each port mapping and hands every accepted
/// connection over to the `Dialer`, until the stop signal fires or its sender is dropped.
/// Readiness is signalled once all local ports are being listened on and the pod has
/// accepted a stream on every remote port.
pub struct Tunnel<D> {
    dialer: Arc<D>,
    ports: Vec<PortMapping>,
    stop: oneshot::Receiver<()>,
    ready: oneshot::Sender<()>,
}

impl<D: Dialer> Tunnel<D> {
    /// Return a new `Self`.
    /// # Arguments
    /// * `dialer` - opens the streams to the pod
    /// * `ports` - the port mappings, eg: `"8888:5000"`
    /// * `stop` - stops the tunnel when signalled
    /// * `ready` - signalled once the tunnel is usable
    pub fn new<P: AsRef<str>>(
        dialer: D,
        ports: &[P],
        stop: oneshot::Receiver<()>,
        ready: oneshot::Sender<()>,
    ) -> Result<Self, TunnelError> {
        ensure!(!ports.is_empty(), NoPorts);
        let ports = ports
            .iter()
            .map(|port| port.as_ref().parse::<PortMapping>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            dialer: Arc::new(dialer),
            ports,
            stop,
            ready,
        })
    }

    /// The port mappings.
    pub fn ports(&self) -> &[PortMapping] {
        &self.ports
    }

    /// Runs the tunnel until it's stopped or it fails to accept connections.
    pub async fn run(self) -> Result<(), TunnelError> {
        let Self {
            dialer,
            ports,
            mut stop,
            ready,
        } = self;

        let mut listeners = Vec::with_capacity(ports.len());
        for mapping in &ports {
            let address = SocketAddr::from(([127, 0, 0, 1], mapping.local()));
            let bind = TcpListener::bind(address).await.context(Listen { address })?;
            let port = bind.local_addr().context(Listen { address })?.port();
            let pod_port = mapping.remote();
            tracing::trace!(port, pod_port, "Bound to local port");

            listeners.push(TcpListenerStream::new(bind).map(move |conn| (pod_port, conn)));
        }

        let connect = async {
            for mapping in &ports {
                let pod_port = mapping.remote();
                dialer.connect(pod_port).await.context(Connect { pod_port })?;
            }
            Ok::<_, TunnelError>(())
        };
        tokio::select! {
            result = connect => result?,
            _ = &mut stop => {
                tracing::debug!("Port forward stopped before becoming ready");
                return Ok(());
            }
        }

        // it's ok if nobody is waiting for the readiness anymore
        ready.send(()).ok();

        let mut incoming = futures::stream::select_all(listeners).take_until(stop);
        while let Some((pod_port, client_conn)) = incoming.next().await {
            let client_conn = client_conn.context(Accept)?;
            if let Ok(peer_addr) = client_conn.peer_addr() {
                tracing::trace!(%peer_addr, pod_port, "new connection");
            }

            let dialer = dialer.clone();
            tokio::spawn(async move {
                if let Err(e) = dialer.forward_connection(client_conn, pod_port).await {
                    tracing::error!(
                        error = e.as_ref() as &dyn std::error::Error,
                        pod_port,
                        "failed to forward connection"
                    );
                }
            });
        }

        tracing::debug!("Port forward stopped");
        Ok(())
    }
}
