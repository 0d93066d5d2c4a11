use crate::{
    error::{Ambiguous, List, NoBackingPod, NoSelector, NotFound, ResolveError},
    ClusterApi, ForwardSpec, LabelSelector, ResourceType,
};
use kube::ResourceExt;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use snafu::{ensure, OptionExt, ResultExt};

/// Only running pods can be forwarded to.
const RUNNING_PODS: &str = "status.phase=Running";

/// Finds the single pod to forward to.
///
/// When a service has more than one matching endpoints object, one of them is picked at
/// random, using the resolver's own random source.
pub struct Resolver<C, R = StdRng> {
    client: C,
    rng: R,
}

impl<C: ClusterApi> Resolver<C> {
    /// Returns a new `Self` with an entropy seeded random source.
    pub fn new(client: C) -> Self {
        Self::with_rng(client, StdRng::from_entropy())
    }
}

impl<C: ClusterApi, R: Rng + Send> Resolver<C, R> {
    /// Returns a new `Self` with the given random source.
    pub fn with_rng(client: C, rng: R) -> Self {
        Self { client, rng }
    }
    /// The cluster api client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the pod name the `spec` points to.
    /// An explicit name is returned as is, without querying the cluster.
    pub async fn resolve(&mut self, spec: &ForwardSpec) -> Result<String, ResolveError> {
        match spec.name() {
            Some(name) => Ok(name.to_string()),
            None => {
                self.find_by_labels(spec.resource(), spec.selector(), spec.namespace())
                    .await
            }
        }
    }

    /// Find the name of the pod by label, returns an error unless exactly one pod is found.
    pub async fn find_by_labels(
        &mut self,
        resource: ResourceType,
        selector: &LabelSelector,
        namespace: &str,
    ) -> Result<String, ResolveError> {
        ensure!(!selector.is_empty(), NoSelector { resource });
        selector.validate()?;

        let pod_name = match resource {
            ResourceType::Pod => self.pod_name(selector, namespace).await,
            ResourceType::Service => self.endpoint_pod_name(selector, namespace).await,
        }?;
        tracing::debug!(%resource, %selector, namespace, %pod_name, "Resolved target pod");
        Ok(pod_name)
    }

    async fn pod_name(
        &mut self,
        selector: &LabelSelector,
        namespace: &str,
    ) -> Result<String, ResolveError> {
        let resource = ResourceType::Pod;
        let mut pods = self
            .client
            .list_pods(namespace, selector, RUNNING_PODS)
            .await
            .context(List { kind: "pods" })?;

        ensure!(
            pods.len() <= 1,
            Ambiguous {
                resource,
                selector: selector.to_string()
            }
        );
        let pod = pods.pop().context(NotFound {
            resource,
            selector: selector.to_string(),
        })?;
        Ok(pod.name_any())
    }

    async fn endpoint_pod_name(
        &mut self,
        selector: &LabelSelector,
        namespace: &str,
    ) -> Result<String, ResolveError> {
        let endpoints = self
            .client
            .list_endpoints(namespace, selector)
            .await
            .context(List { kind: "endpoints" })?;
        tracing::trace!(%selector, count = endpoints.len(), "Listed endpoints");

        let endpoint = endpoints.choose(&mut self.rng).context(NotFound {
            resource: ResourceType::Service,
            selector: selector.to_string(),
        })?;

        // references without a pod name are skipped
        let subsets = endpoint.subsets.iter().flatten();
        let addresses = subsets.flat_map(|subset| subset.addresses.iter().flatten());
        let pod_name = addresses
            .filter_map(|address| address.target_ref.as_ref())
            .find_map(|target| target.name.clone());

        pod_name.context(NoBackingPod {
            endpoint: endpoint.name_any(),
        })
    }
}
