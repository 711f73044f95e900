//! The instance listing pipeline.
//!
//! A listing request is answered in one pass:
//! 1. Resolve the project topology from the cluster store
//! 2. Dispatch every node group: local instances go to the render pool,
//!    remote nodes are fetched concurrently, offline nodes produce error
//!    records without any network traffic
//! 3. Wait for every producer, then order the collected records
//!
//! The whole pass is re-run by [`InstanceLister::list_with_retry`] while the
//! cluster store reports lock contention.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fleet_filter::FilterExpression;
use fleet_retry::{RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::aggregate::{sort_by_name, InstanceRecord, ResultAccumulator};
use crate::error::ListingError;
use crate::instance::{
    Instance, InstanceFull, InstanceSource, InstanceSummary, InstanceType, NameOnly, RenderError,
};
use crate::pool::RenderPool;
use crate::remote::RemoteFetcher;
use crate::store::{ClusterStore, LOCAL_NODE_ADDRESS};
use crate::topology::{self, NodeKind, TopologySnapshot};

/// Version prefix of resource URLs.
pub const API_VERSION: &str = "1.0";

/// Project used when the request does not name one.
pub const DEFAULT_PROJECT: &str = "default";

/// Result shape requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Recursion {
    /// Resource URLs only.
    #[default]
    Urls,
    /// [`InstanceSummary`] records.
    Summaries,
    /// [`InstanceFull`] records.
    Full,
}

impl Recursion {
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Recursion::Urls,
            1 => Recursion::Summaries,
            _ => Recursion::Full,
        }
    }

    /// Parse the `recursion` query value. Anything that is not a
    /// non-negative integer means level 0.
    pub fn from_query(raw: Option<&str>) -> Self {
        raw.and_then(|r| r.trim().parse::<u32>().ok())
            .map(Self::from_level)
            .unwrap_or_default()
    }

    pub fn level(&self) -> u32 {
        match self {
            Recursion::Urls => 0,
            Recursion::Summaries => 1,
            Recursion::Full => 2,
        }
    }
}

impl fmt::Display for Recursion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Collection endpoint a listing came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Route {
    #[default]
    Instances,
    Containers,
    VirtualMachines,
}

impl Route {
    /// Path segment used in resource URLs.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Route::Instances => "instances",
            Route::Containers => "containers",
            Route::VirtualMachines => "virtual-machines",
        }
    }

    /// Instance type implied by the endpoint, if any.
    pub fn implied_type(&self) -> Option<InstanceType> {
        match self {
            Route::Instances => None,
            Route::Containers => Some(InstanceType::Container),
            Route::VirtualMachines => Some(InstanceType::VirtualMachine),
        }
    }
}

/// Raw query parameters of a listing request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingParams {
    pub recursion: Option<String>,
    pub filter: Option<String>,
    pub project: Option<String>,
    #[serde(rename = "instance-type")]
    pub instance_type: Option<String>,
}

/// A validated listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub project: String,
    pub recursion: Recursion,
    pub filter: Option<FilterExpression>,
    pub instance_type: InstanceType,
    pub route: Route,
    /// Set on requests forwarded by another cluster member. Only instances
    /// of this node are reported.
    pub cluster_notification: bool,
}

impl Default for ListingRequest {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            recursion: Recursion::default(),
            filter: None,
            instance_type: InstanceType::Any,
            route: Route::default(),
            cluster_notification: false,
        }
    }
}

impl ListingRequest {
    /// Validate raw parameters.
    ///
    /// The endpoint's implied type takes precedence over `instance-type`.
    pub fn from_params(
        route: Route,
        params: &ListingParams,
        cluster_notification: bool,
    ) -> Result<Self, ListingError> {
        let instance_type = match route.implied_type() {
            Some(implied) => implied,
            None => params
                .instance_type
                .as_deref()
                .unwrap_or_default()
                .parse()?,
        };

        let filter = match params.filter.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(FilterExpression::parse(raw)?),
        };

        let project = match params.project.as_deref() {
            None | Some("") => DEFAULT_PROJECT.to_string(),
            Some(project) => project.to_string(),
        };

        Ok(Self {
            project,
            recursion: Recursion::from_query(params.recursion.as_deref()),
            filter,
            instance_type,
            route,
            cluster_notification,
        })
    }

    fn url_for(&self, name: &str) -> String {
        format!("/{API_VERSION}/{}/{name}", self.route.path_segment())
    }
}

/// Listing result in the shape selected by the recursion level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ListingResult {
    Urls(Vec<String>),
    Summaries(Vec<InstanceSummary>),
    Full(Vec<InstanceFull>),
}

impl ListingResult {
    pub fn len(&self) -> usize {
        match self {
            ListingResult::Urls(urls) => urls.len(),
            ListingResult::Summaries(records) => records.len(),
            ListingResult::Full(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type LocalInstances = HashMap<String, Arc<dyn Instance>>;

/// Answers listing requests for one cluster member.
#[derive(Clone)]
pub struct InstanceLister {
    inner: Arc<ListerInner>,
}

struct ListerInner {
    store: Arc<dyn ClusterStore>,
    instances: Arc<dyn InstanceSource>,
    fetcher: RemoteFetcher,
    pool: RenderPool,
    retry: RetryPolicy,
}

impl InstanceLister {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        instances: Arc<dyn InstanceSource>,
        fetcher: RemoteFetcher,
        pool: RenderPool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ListerInner {
                store,
                instances,
                fetcher,
                pool,
                retry,
            }),
        }
    }

    /// Run [`InstanceLister::list`], re-running it while the store is locked.
    pub async fn list_with_retry(
        &self,
        request: &ListingRequest,
    ) -> Result<ListingResult, ListingError> {
        self.inner
            .retry
            .run(
                |attempt| {
                    if attempt > 1 {
                        debug!(attempt, project = %request.project, "Retrying instance listing");
                    }
                    self.list(request)
                },
                ListingError::is_retriable,
            )
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, .. } => ListingError::LockExhausted { attempts },
                RetryError::Permanent(e) => e,
            })
    }

    /// Run the listing pipeline once.
    pub async fn list(&self, request: &ListingRequest) -> Result<ListingResult, ListingError> {
        debug!(
            project = %request.project,
            recursion = %request.recursion,
            instance_type = %request.instance_type,
            filtered = request.filter.is_some(),
            "Listing instances"
        );

        let topology = Arc::new(topology::resolve(
            self.inner.store.as_ref(),
            &request.project,
            request.instance_type,
        )?);

        let local = self.load_local(request, &topology).await?;

        let result = match request.recursion {
            Recursion::Urls => ListingResult::Urls(self.collect_urls(request, &topology, &local).await),
            Recursion::Summaries => ListingResult::Summaries(
                self.collect_records(request, &topology, &local).await,
            ),
            Recursion::Full => {
                ListingResult::Full(self.collect_records(request, &topology, &local).await)
            }
        };

        debug!(
            project = %request.project,
            recursion = %request.recursion,
            results = result.len(),
            "Listed instances"
        );

        Ok(result)
    }

    /// Load this node's instances when the local group needs rendering or
    /// filtering.
    async fn load_local(
        &self,
        request: &ListingRequest,
        topology: &TopologySnapshot,
    ) -> Result<Arc<LocalInstances>, ListingError> {
        let has_local = topology
            .by_node_address
            .get(LOCAL_NODE_ADDRESS)
            .is_some_and(|names| !names.is_empty());
        let needed = request.recursion != Recursion::Urls || request.filter.is_some();

        if !has_local || !needed {
            return Ok(Arc::new(HashMap::new()));
        }

        let loaded = self
            .inner
            .instances
            .load_node_project_all(&request.project, request.instance_type)
            .await?;

        Ok(Arc::new(
            loaded
                .into_iter()
                .map(|instance| (instance.name().to_string(), instance))
                .collect(),
        ))
    }

    async fn collect_urls(
        &self,
        request: &ListingRequest,
        topology: &TopologySnapshot,
        local: &LocalInstances,
    ) -> Vec<String> {
        let urls = Arc::new(ResultAccumulator::new());
        let mut fetches = JoinSet::new();

        for (address, names) in &topology.by_node_address {
            if request.cluster_notification && address != LOCAL_NODE_ADDRESS {
                continue;
            }

            let Some(filter) = request.filter.as_ref() else {
                urls.extend(names.iter().map(|name| request.url_for(name)));
                continue;
            };

            match NodeKind::of(address) {
                NodeKind::Local => urls.extend(
                    names
                        .iter()
                        .filter(|name| local_matches(local, filter, name))
                        .map(|name| request.url_for(name)),
                ),
                NodeKind::Offline => urls.extend(
                    names
                        .iter()
                        .filter(|name| filter.evaluate(&NameOnly(name)))
                        .map(|name| request.url_for(name)),
                ),
                NodeKind::Remote(address) => {
                    let fetcher = self.inner.fetcher.clone();
                    let urls = Arc::clone(&urls);
                    let request = request.clone();
                    let address = address.to_string();
                    let names = names.clone();
                    fetches.spawn(async move {
                        let Some(filter) = request.filter.as_ref() else {
                            return;
                        };
                        match fetcher
                            .fetch_summaries(&request.project, &address, request.instance_type)
                            .await
                        {
                            Ok(records) => urls.extend(
                                records
                                    .iter()
                                    .filter(|record| filter.evaluate(*record))
                                    .map(|record| request.url_for(&record.name)),
                            ),
                            Err(e) => {
                                warn!(node = %address, error = %e, "Failed to fetch instances for filtering");
                                urls.extend(
                                    names
                                        .iter()
                                        .filter(|name| filter.evaluate(&NameOnly(name)))
                                        .map(|name| request.url_for(name)),
                                );
                            }
                        }
                    });
                }
            }
        }

        join_all(fetches).await;
        urls.take()
    }

    async fn collect_records<R: InstanceRecord>(
        &self,
        request: &ListingRequest,
        topology: &Arc<TopologySnapshot>,
        local: &Arc<LocalInstances>,
    ) -> Vec<R> {
        let records = Arc::new(ResultAccumulator::<R>::new());
        let filter = request.filter.clone().map(Arc::new);
        let mut fetches = JoinSet::new();
        let mut local_names = Vec::new();

        for (address, names) in &topology.by_node_address {
            if request.cluster_notification && address != LOCAL_NODE_ADDRESS {
                continue;
            }

            match NodeKind::of(address) {
                NodeKind::Offline => records.extend(
                    names
                        .iter()
                        .filter(|name| name_matches(filter.as_deref(), name))
                        .map(|name| R::error_record(name, topology.owner(name))),
                ),
                NodeKind::Remote(address) => {
                    let fetcher = self.inner.fetcher.clone();
                    let records = Arc::clone(&records);
                    let topology = Arc::clone(topology);
                    let filter = filter.clone();
                    let project = request.project.clone();
                    let instance_type = request.instance_type;
                    let address = address.to_string();
                    let names = names.clone();
                    fetches.spawn(async move {
                        match R::fetch(&fetcher, &project, &address, instance_type).await {
                            Ok(fetched) => records.extend(fetched.into_iter().filter(|record| {
                                filter.as_deref().is_none_or(|f| f.evaluate(record))
                            })),
                            Err(e) => {
                                warn!(
                                    node = %address,
                                    instances = names.len(),
                                    error = %e,
                                    "Marking instances of unreachable node as errored"
                                );
                                records.extend(
                                    names
                                        .iter()
                                        .filter(|name| name_matches(filter.as_deref(), name))
                                        .map(|name| R::error_record(name, topology.owner(name))),
                                );
                            }
                        }
                    });
                }
                NodeKind::Local => local_names.extend(
                    names
                        .iter()
                        .filter(|name| match &filter {
                            Some(filter) => local_matches(local, filter, name),
                            None => true,
                        })
                        .cloned(),
                ),
            }
        }

        let work = {
            let local = Arc::clone(local);
            let records = Arc::clone(&records);
            let topology = Arc::clone(topology);
            move |name: String| {
                let instance = local.get(&name).cloned();
                let records = Arc::clone(&records);
                let topology = Arc::clone(&topology);
                async move {
                    let rendered = match instance {
                        Some(instance) => R::render(instance.as_ref()).await,
                        None => Err(RenderError::new(&name, "not loaded on this node")),
                    };
                    match rendered {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!(instance = %name, error = %e, "Failed to render instance");
                            records.push(R::error_record(&name, topology.owner(&name)));
                        }
                    }
                }
            }
        };

        let on_panic = {
            let records = Arc::clone(&records);
            let topology = Arc::clone(topology);
            move |name: String, _: JoinError| {
                records.push(R::error_record(&name, topology.owner(&name)));
            }
        };

        self.inner.pool.run(local_names, work, on_panic).await;
        join_all(fetches).await;

        let mut collected = records.take();
        sort_by_name(&mut collected);
        collected
    }
}

fn name_matches(filter: Option<&FilterExpression>, name: &str) -> bool {
    filter.is_none_or(|f| f.evaluate(&NameOnly(name)))
}

/// A local name passes the filter only if it loaded and matches.
fn local_matches(local: &LocalInstances, filter: &FilterExpression, name: &str) -> bool {
    local
        .get(name)
        .is_some_and(|instance| filter.evaluate(instance.as_ref()))
}

async fn join_all(mut fetches: JoinSet<()>) {
    while let Some(joined) = fetches.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Remote fetch task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, Recursion::Urls)]
    #[case(Some(""), Recursion::Urls)]
    #[case(Some("0"), Recursion::Urls)]
    #[case(Some("1"), Recursion::Summaries)]
    #[case(Some("2"), Recursion::Full)]
    #[case(Some("3"), Recursion::Full)]
    #[case(Some("-1"), Recursion::Urls)]
    #[case(Some("abc"), Recursion::Urls)]
    fn test_recursion_from_query(#[case] raw: Option<&str>, #[case] expected: Recursion) {
        assert_eq!(Recursion::from_query(raw), expected);
    }

    #[test]
    fn test_any_instance_type_param() {
        let params = ListingParams {
            instance_type: Some("any".to_string()),
            ..Default::default()
        };
        let request = ListingRequest::from_params(Route::Instances, &params, false).unwrap();
        assert_eq!(request.instance_type, InstanceType::Any);
    }

    #[test]
    fn test_route_wins_over_param() {
        let params = ListingParams {
            instance_type: Some("virtual-machine".to_string()),
            ..Default::default()
        };
        let request = ListingRequest::from_params(Route::Containers, &params, false).unwrap();
        assert_eq!(request.instance_type, InstanceType::Container);

        let request = ListingRequest::from_params(Route::Instances, &params, false).unwrap();
        assert_eq!(request.instance_type, InstanceType::VirtualMachine);
    }

    #[test]
    fn test_invalid_instance_type() {
        let params = ListingParams {
            instance_type: Some("vm".to_string()),
            ..Default::default()
        };
        let err = ListingRequest::from_params(Route::Instances, &params, false).unwrap_err();
        assert!(matches!(err, ListingError::InstanceType(_)));
    }

    #[test]
    fn test_request_defaults() {
        let request =
            ListingRequest::from_params(Route::Instances, &ListingParams::default(), false).unwrap();
        assert_eq!(request, ListingRequest::default());
    }

    #[test]
    fn test_malformed_filter_rejected() {
        let params = ListingParams {
            filter: Some("name eq".to_string()),
            ..Default::default()
        };
        let err = ListingRequest::from_params(Route::Instances, &params, false).unwrap_err();
        assert!(matches!(err, ListingError::Filter(ref f) if f.is_incomplete()));
    }

    #[test]
    fn test_url_for_route() {
        let request = ListingRequest {
            route: Route::VirtualMachines,
            ..Default::default()
        };
        assert_eq!(request.url_for("vm1"), "/1.0/virtual-machines/vm1");
    }

    #[test]
    fn test_result_serializes_untagged() {
        let result = ListingResult::Urls(vec!["/1.0/instances/c1".to_string()]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!(["/1.0/instances/c1"]));
    }
}
