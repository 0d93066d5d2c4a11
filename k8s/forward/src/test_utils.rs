//! In-memory stand-ins for the kubernetes api-server and the port-forward transport.

use crate::{
    vx::{EndpointAddress, EndpointSubset, Endpoints, ObjectReference, Pod, PodStatus},
    ClusterApi, Dialer, LabelSelector, Transport,
};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Notify};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Objects without a namespace are visible from every namespace.
fn in_namespace(meta: &ObjectMeta, namespace: &str) -> bool {
    meta.namespace.as_deref().map_or(true, |ns| ns == namespace)
}

/// A running pod under construction.
pub(crate) struct TestPod(Pod);
impl TestPod {
    pub(crate) fn with_phase(mut self, phase: &str) -> Self {
        self.0.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
        self
    }
    pub(crate) fn with_namespace(mut self, namespace: &str) -> Self {
        self.0.metadata.namespace = Some(namespace.to_string());
        self
    }
}
impl From<TestPod> for Pod {
    fn from(pod: TestPod) -> Self {
        pod.0
    }
}

pub(crate) fn new_pod(name: &str, pod_labels: &[(&str, &str)]) -> TestPod {
    TestPod(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Endpoints with a single subset holding one address per entry of `pods`, with the
/// address backed by the named pod if any.
pub(crate) fn new_endpoints(
    name: &str,
    endpoint_labels: &[(&str, &str)],
    pods: &[Option<&str>],
) -> Endpoints {
    let addresses = pods
        .iter()
        .enumerate()
        .map(|(i, pod)| EndpointAddress {
            ip: format!("10.0.0.{}", i + 1),
            target_ref: pod.map(|pod| ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(endpoint_labels)),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}

/// Serves the pods and endpoints it's given, honouring the label selector, the namespace
/// and the `status.phase` field selector.
#[derive(Default)]
pub(crate) struct FakeCluster {
    pods: Vec<Pod>,
    endpoints: Vec<Endpoints>,
    list_calls: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn with_pod(mut self, pod: impl Into<Pod>) -> Self {
        self.pods.push(pod.into());
        self
    }
    pub(crate) fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints.push(endpoints);
        self
    }
    /// How many list requests were made.
    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

fn phase_matches(pod: &Pod, field_selector: &str) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    field_selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .filter(|(field, _)| *field == "status.phase")
        .all(|(_, value)| phase == Some(value))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        field_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pods
            .iter()
            .filter(|pod| in_namespace(&pod.metadata, namespace))
            .filter(|pod| selector.matches(pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
            .filter(|pod| phase_matches(pod, field_selector))
            .cloned()
            .collect())
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Endpoints>, kube::Error> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .endpoints
            .iter()
            .filter(|ep| in_namespace(&ep.metadata, namespace))
            .filter(|ep| selector.matches(ep.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
            .cloned()
            .collect())
    }
}

/// How the pod reacts when the tunnel first connects to it.
#[derive(Clone, Default)]
pub(crate) enum PodConnect {
    #[default]
    Accept,
    /// The pod doesn't exist.
    Refuse,
    /// Never answers, notifying once the connect is underway.
    Stall(Arc<Notify>),
}

/// Answers each connection with `"<pod>:<port> "` followed by whatever it was sent.
pub(crate) struct EchoDialer {
    pod_name: String,
    connect: PodConnect,
}
impl EchoDialer {
    pub(crate) fn new(pod_name: &str) -> Self {
        Self::with_connect(pod_name, PodConnect::Accept)
    }
    pub(crate) fn with_connect(pod_name: &str, connect: PodConnect) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            connect,
        }
    }
}

#[async_trait]
impl Dialer for EchoDialer {
    async fn connect(&self, _pod_port: u16) -> anyhow::Result<()> {
        match &self.connect {
            PodConnect::Accept => Ok(()),
            PodConnect::Refuse => Err(anyhow::anyhow!("pods \"{}\" not found", self.pod_name)),
            PodConnect::Stall(connecting) => {
                connecting.notify_one();
                futures::future::pending().await
            }
        }
    }

    async fn forward_connection(
        &self,
        mut client_conn: TcpStream,
        pod_port: u16,
    ) -> anyhow::Result<()> {
        let (mut reader, mut writer) = client_conn.split();
        let greeting = format!("{}:{} ", self.pod_name, pod_port);
        writer.write_all(greeting.as_bytes()).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Hands out `EchoDialer`s and records which pods were dialed.
#[derive(Default)]
pub(crate) struct FakeTransport {
    fail: bool,
    connect: PodConnect,
    dialed: Mutex<Vec<(String, String)>>,
}
impl FakeTransport {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
    /// The dialers it hands out connect to the pod as given.
    pub(crate) fn connecting(connect: PodConnect) -> Self {
        Self {
            connect,
            ..Default::default()
        }
    }
    pub(crate) fn dialed(&self) -> Vec<(String, String)> {
        self.dialed.lock().expect("not poisoned").clone()
    }
}

impl Transport for FakeTransport {
    type Dialer = EchoDialer;

    fn dialer(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<EchoDialer, Box<dyn std::error::Error + Send + Sync>> {
        if self.fail {
            return Err("upgrade not supported".into());
        }
        self.dialed
            .lock()
            .expect("not poisoned")
            .push((namespace.to_string(), pod_name.to_string()));
        Ok(EchoDialer::with_connect(pod_name, self.connect.clone()))
    }
}
