use crate::{
    error::{Config, Error, Kubeconfig},
    vx::{Endpoints, Pod},
    LabelSelector,
};
use async_trait::async_trait;
use kube::api::{Api, ListParams};
use snafu::ResultExt;
use std::path::PathBuf;
use tokio::net::TcpStream;

/// The kubernetes api calls used to find the target pod.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List the pods in the namespace which match the label and field selectors.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        field_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error>;
    /// List the endpoints in the namespace which match the label selector.
    async fn list_endpoints(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Endpoints>, kube::Error>;
}

/// Opens streams to a single pod.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Check that the pod accepts a stream on the given port.
    async fn connect(&self, pod_port: u16) -> anyhow::Result<()>;
    /// Relay the local connection to the given port of the pod, until either side closes.
    async fn forward_connection(&self, client_conn: TcpStream, pod_port: u16)
        -> anyhow::Result<()>;
}

/// Builds dialers scoped to a pod.
pub trait Transport: Send + Sync {
    /// The dialer type.
    type Dialer: Dialer;
    /// Build a dialer for the pod with the given name.
    fn dialer(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Self::Dialer, Box<dyn std::error::Error + Send + Sync>>;
}

/// The kubernetes api-server, accessed through a `kube::Client`.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Returns a new `Self` using the provided `kube::Client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
    /// Tries to return a default `Self`, with the config inferred from the environment.
    pub async fn try_default() -> Result<Self, Error> {
        let client = kube::Client::try_default().await.context(Config)?;
        Ok(Self::new(client))
    }
    /// Create a new `Self`, from the kubeconfig file if provided, otherwise with default.
    pub async fn from_kubeconfig(kube_config_path: Option<PathBuf>) -> Result<Self, Error> {
        let Some(config_path) = kube_config_path else {
            return Self::try_default().await;
        };
        let kube_config = kube::config::Kubeconfig::read_from(&config_path).context(Kubeconfig)?;
        let config = kube::Config::from_custom_kubeconfig(kube_config, &Default::default())
            .await
            .context(Kubeconfig)?;
        let client = kube::Client::try_from(config).context(Config)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        field_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let mut list_params = ListParams::default()
            .labels(&selector.to_string())
            .fields(field_selector)
            .limit(100);

        let mut pods: Vec<Pod> = vec![];

        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        // Paginate to get 100 contents at a time
        loop {
            let mut result = pods_api.list(&list_params).await?;
            pods.append(&mut result.items);
            match result.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    list_params = list_params.continue_token(token.as_str())
                }
                _ => break,
            };
        }
        Ok(pods)
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Endpoints>, kube::Error> {
        let mut list_params = ListParams::default()
            .labels(&selector.to_string())
            .limit(100);

        let mut endpoints: Vec<Endpoints> = vec![];

        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        loop {
            let mut result = endpoints_api.list(&list_params).await?;
            endpoints.append(&mut result.items);
            match result.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    list_params = list_params.continue_token(token.as_str())
                }
                _ => break,
            };
        }
        Ok(endpoints)
    }
}

impl Transport for KubeCluster {
    type Dialer = PodDialer;

    fn dialer(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<PodDialer, Box<dyn std::error::Error + Send + Sync>> {
        Ok(PodDialer {
            pod_api: Api::namespaced(self.client.clone(), namespace),
            pod_name: pod_name.to_string(),
        })
    }
}

/// Dials a pod through the api-server port-forward sub-resource.
/// Every local connection gets its own port-forward stream.
#[derive(Clone)]
pub struct PodDialer {
    pod_api: Api<Pod>,
    pod_name: String,
}

#[async_trait]
impl Dialer for PodDialer {
    async fn connect(&self, pod_port: u16) -> anyhow::Result<()> {
        let pod_name = self.pod_name.as_str();
        let mut forwarder = self.pod_api.portforward(pod_name, &[pod_port]).await?;
        let upstream_conn = forwarder
            .take_stream(pod_port)
            .ok_or_else(|| anyhow::anyhow!("port {pod_port} not found in forwarder"))?;

        drop(upstream_conn);
        forwarder.abort();
        tracing::trace!(pod_port, pod_name, "pod accepted the stream");
        Ok(())
    }

    async fn forward_connection(
        &self,
        mut client_conn: TcpStream,
        pod_port: u16,
    ) -> anyhow::Result<()> {
        let pod_name = self.pod_name.as_str();
        let mut forwarder = self.pod_api.portforward(pod_name, &[pod_port]).await?;

        let mut upstream_conn = forwarder
            .take_stream(pod_port)
            .ok_or_else(|| anyhow::anyhow!("port {pod_port} not found in forwarder"))?;

        tracing::debug!(pod_port, pod_name, "forwarding connection");

        if let Err(error) =
            tokio::io::copy_bidirectional(&mut client_conn, &mut upstream_conn).await
        {
            tracing::trace!(pod_port, pod_name, ?error, "connection error");
        }

        drop(upstream_conn);
        forwarder.join().await?;
        tracing::debug!(pod_port, pod_name, "connection closed");
        Ok(())
    }
}
