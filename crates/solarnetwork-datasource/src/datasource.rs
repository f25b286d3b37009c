//! The data source: a Grafana-independent [`Instance`] per configured data
//! source, and the [`SolarNetworkDatasource`] plugin service that routes
//! Grafana's requests to it.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use grafana_plugin_sdk::{backend, data, prelude::*};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    config::{DatasourceSettings, JsonData, SecureJsonData},
    domain::NameCatalogue,
    executor::{ReqwestTransport, RequestExecutor, Transport},
    planner::{self, QueryJson, QueryMode, QueryTarget},
    reshape::{self, SeriesFrame},
    signing_key::{KeyIssuer, SecretKeyIssuer, SigningKeyCache, SigningKeyInfo},
    Error, Result,
};

/// The message of a passing health check.
pub const HEALTHY: &str = "Data source is working";

/// The time range a target is queried over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryRange {
    /// Start of the range.
    pub from: DateTime<Utc>,
    /// End of the range.
    pub to: DateTime<Utc>,
}

/// One configured data source: the request executor, its signing key cache,
/// and the node list, which is loaded once and kept for the instance's lifetime.
#[derive(Debug)]
pub struct Instance<T = ReqwestTransport, I = SecretKeyIssuer> {
    executor: RequestExecutor<T, I>,
    node_ids: OnceCell<Vec<i64>>,
}

impl<T: Transport> Instance<T, SecretKeyIssuer> {
    /// Build an instance that derives signing keys from the configured secret.
    pub fn from_settings(settings: DatasourceSettings, transport: T) -> Self {
        Self::new(RequestExecutor::new(
            transport,
            SigningKeyCache::new(SecretKeyIssuer::new(settings.secret)),
            settings.environment,
            settings.token,
        ))
    }
}

impl<T, I> Instance<T, I>
where
    T: Transport,
    I: KeyIssuer,
{
    /// Build an instance around `executor`.
    pub fn new(executor: RequestExecutor<T, I>) -> Self {
        Self {
            executor,
            node_ids: OnceCell::new(),
        }
    }

    /// The node ids the token can access, fetched on first use.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_node_list(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        self.node_ids
            .get_or_try_init(|| self.executor.list_all_node_ids(now))
            .await
            .cloned()
    }

    /// The current signing key, in its bootstrap form.
    pub async fn signing_key(&self, now: DateTime<Utc>) -> Result<SigningKeyInfo> {
        let key = self.executor.keys().key(now).await?;
        Ok(SigningKeyInfo::from(key.as_ref()))
    }

    /// Run every target over `range`. See [`Instance::query_batch`].
    pub async fn query(
        &self,
        targets: &[QueryTarget],
        range: QueryRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeriesFrame>> {
        let batch: Vec<_> = targets.iter().cloned().map(|t| (t, range)).collect();
        self.query_batch(&batch, now).await
    }

    /// Run every target of `batch` concurrently, returning their frames in
    /// target order.
    ///
    /// The batch fails as a whole: if any target fails, its error is returned
    /// and the frames of the other targets are discarded.
    #[tracing::instrument(level = "debug", skip_all, fields(targets = batch.len()))]
    pub async fn query_batch(
        &self,
        batch: &[(QueryTarget, QueryRange)],
        now: DateTime<Utc>,
    ) -> Result<Vec<SeriesFrame>> {
        let frames = try_join_all(
            batch
                .iter()
                .map(|(target, range)| self.query_target(target, *range, now)),
        )
        .await?;
        Ok(frames.into_iter().flatten().collect())
    }

    async fn query_target(
        &self,
        target: &QueryTarget,
        range: QueryRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeriesFrame>> {
        if target.node_ids.is_empty() {
            debug!(ref_id = %target.ref_id, "Skipping query without nodes");
            return Ok(Vec::new());
        }
        let plan = planner::plan(target, range.from, range.to);
        let rows = match plan.mode {
            QueryMode::List | QueryMode::Combining => {
                self.executor.list_datum(&plan.filter, now).await?
            }
            QueryMode::Reading(reading_type) => {
                self.executor
                    .datum_reading(reading_type, &plan.filter, now)
                    .await?
            }
        };
        reshape::reshape(&plan, &rows)
    }

    /// Check the credentials by listing node ids, bypassing the node list cache.
    pub async fn test_connection(&self, now: DateTime<Utc>) -> Result<()> {
        self.executor.list_all_node_ids(now).await.map(|_| ())
    }
}

type Settings = backend::DataSourceInstanceSettings<JsonData, SecureJsonData>;

#[derive(Debug)]
struct CachedInstance<T> {
    updated: DateTime<Utc>,
    instance: Arc<Instance<T>>,
}

/// Instances by data source `uid`, rebuilt when their settings are updated.
///
/// Grafana does not announce deleted data sources, so their entries stay
/// until the plugin restarts. An entry holds no connection of its own.
#[derive(Debug, Default)]
struct InstanceCache<T> {
    transport: T,
    instances: Mutex<HashMap<String, CachedInstance<T>>>,
}

impl<T: Transport + Clone> InstanceCache<T> {
    /// The instance for data source `uid` as of `updated`, building it from
    /// `json` and `secure` if the cached one is missing or out of date.
    fn get(
        &self,
        uid: &str,
        updated: DateTime<Utc>,
        json: &JsonData,
        secure: &SecureJsonData,
    ) -> Result<Arc<Instance<T>>> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = instances.get(uid) {
            if cached.updated == updated {
                return Ok(Arc::clone(&cached.instance));
            }
        }
        let config = DatasourceSettings::from_parts(json, secure)?;
        info!(%uid, environment = ?config.environment, "Configuring data source instance");
        let instance = Arc::new(Instance::from_settings(config, self.transport.clone()));
        // Replaces the entry for an earlier version of the settings.
        instances.insert(
            uid.to_string(),
            CachedInstance {
                updated,
                instance: Arc::clone(&instance),
            },
        );
        Ok(instance)
    }
}

/// The SolarNetwork data source plugin.
#[derive(Clone, Debug, Default, GrafanaPlugin)]
#[grafana_plugin(
    plugin_type = "datasource",
    json_data = "JsonData",
    secure_json_data = "SecureJsonData"
)]
pub struct SolarNetworkDatasource {
    instances: Arc<InstanceCache<ReqwestTransport>>,
}

impl SolarNetworkDatasource {
    fn instance(&self, settings: Option<Settings>) -> Result<Arc<Instance>> {
        let settings = settings.ok_or(Error::MissingInstanceSettings)?;
        self.instances.get(
            &settings.uid,
            settings.updated,
            &settings.json_data,
            &settings.decrypted_secure_json_data,
        )
    }

    async fn run_queries(
        &self,
        request: backend::QueryDataRequest<QueryJson, Self>,
    ) -> Result<Vec<SeriesFrame>> {
        let instance = self.instance(request.plugin_context.instance_settings)?;
        let batch = request
            .queries
            .into_iter()
            .map(|q| {
                let range = QueryRange {
                    from: q.time_range.from,
                    to: q.time_range.to,
                };
                Ok((QueryTarget::from_json(q.ref_id, q.query)?, range))
            })
            .collect::<Result<Vec<_>>>()?;
        instance.query_batch(&batch, Utc::now()).await
    }
}

/// An error answering one query of a batch.
#[derive(Debug, Error)]
#[error("query {ref_id} failed: {error}")]
pub struct QueryError {
    ref_id: String,
    error: Arc<Error>,
}

impl backend::DataQueryError for QueryError {
    fn ref_id(self) -> String {
        self.ref_id
    }

    fn status(&self) -> backend::DataQueryStatus {
        self.error.status()
    }

    fn source(&self) -> backend::ErrorSource {
        self.error.error_source()
    }
}

/// Report `error` for every query of a failed batch, in query order.
fn error_responses(
    ref_ids: Vec<String>,
    error: Error,
) -> Vec<Result<backend::DataResponse, QueryError>> {
    let error = Arc::new(error);
    ref_ids
        .into_iter()
        .map(|ref_id| {
            Err(QueryError {
                ref_id,
                error: Arc::clone(&error),
            })
        })
        .collect()
}

/// Group frames into one response per query, in query order.
fn responses(
    ref_ids: Vec<String>,
    frames: Vec<SeriesFrame>,
) -> Vec<Result<backend::DataResponse, QueryError>> {
    let mut by_ref_id: HashMap<String, Vec<data::Frame>> = HashMap::new();
    for frame in frames {
        by_ref_id
            .entry(frame.ref_id.clone())
            .or_default()
            .push(frame.into_frame());
    }
    ref_ids
        .into_iter()
        .map(|ref_id| {
            let frames = by_ref_id.remove(&ref_id).unwrap_or_default();
            let checked = frames
                .iter()
                .map(data::Frame::check)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| QueryError {
                    ref_id: ref_id.clone(),
                    error: Arc::new(Error::Frame(e)),
                })?;
            Ok(backend::DataResponse::new(ref_id.clone(), checked))
        })
        .collect()
}

#[backend::async_trait]
impl backend::DataService for SolarNetworkDatasource {
    type Query = QueryJson;
    type QueryError = QueryError;
    type Stream = backend::BoxDataResponseStream<Self::QueryError>;

    async fn query_data(
        &self,
        request: backend::QueryDataRequest<Self::Query, Self>,
    ) -> Self::Stream {
        let ref_ids: Vec<String> = request.queries.iter().map(|q| q.ref_id.clone()).collect();
        let responses = match self.run_queries(request).await {
            Ok(frames) => responses(ref_ids, frames),
            Err(error) => {
                warn!(%error, "Query batch failed");
                error_responses(ref_ids, error)
            }
        };
        Box::pin(futures_util::stream::iter(responses))
    }
}

#[backend::async_trait]
impl backend::DiagnosticsService for SolarNetworkDatasource {
    type CheckHealthError = Infallible;

    async fn check_health(
        &self,
        request: backend::CheckHealthRequest<Self>,
    ) -> Result<backend::CheckHealthResponse, Self::CheckHealthError> {
        let result = match self.instance(request.plugin_context.instance_settings) {
            Ok(instance) => instance.test_connection(Utc::now()).await,
            Err(e) => Err(e),
        };
        Ok(match result {
            Ok(()) => {
                info!("Health check passed");
                backend::CheckHealthResponse::ok(HEALTHY.to_string())
            }
            Err(error) => {
                warn!(%error, "Health check failed");
                backend::CheckHealthResponse::error(error.to_string())
            }
        })
    }

    type CollectMetricsError = Infallible;

    async fn collect_metrics(
        &self,
        _request: backend::CollectMetricsRequest<Self>,
    ) -> Result<backend::CollectMetricsResponse, Self::CollectMetricsError> {
        Ok(backend::CollectMetricsResponse::new(None))
    }
}

/// An error answering a resource call.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No resource is served at the requested path.
    #[error("resource {0:?} not found")]
    NotFound(String),

    /// The data source could not answer.
    #[error(transparent)]
    Datasource(#[from] Error),

    /// The response could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

impl backend::ErrIntoHttpResponse for ResourceError {
    fn into_http_response(
        self,
    ) -> std::result::Result<http::Response<Bytes>, Box<dyn std::error::Error>> {
        let status = match &self {
            Self::NotFound(_) => http::StatusCode::NOT_FOUND,
            Self::Datasource(e) => e.http_status(),
            Self::Http(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        Ok(http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(serde_json::to_vec(
                &serde_json::json!({ "error": self.to_string() }),
            )?))?)
    }
}

fn json_response<T: Serialize>(
    value: &T,
) -> std::result::Result<http::Response<Bytes>, ResourceError> {
    let body = serde_json::to_vec(value).map_err(Error::from)?;
    Ok(http::Response::builder()
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))?)
}

#[backend::async_trait]
impl backend::ResourceService for SolarNetworkDatasource {
    type Error = ResourceError;
    type InitialResponse = http::Response<Bytes>;
    type Stream = backend::BoxResourceStream<Self::Error>;

    async fn call_resource(
        &self,
        r: backend::CallResourceRequest<Self>,
    ) -> std::result::Result<(Self::InitialResponse, Self::Stream), Self::Error> {
        let path = r.request.uri().path().trim_start_matches('/').to_string();
        debug!(%path, "Resource call");
        let response = match path.as_str() {
            "names" => json_response(&NameCatalogue::default())?,
            "nodes" => {
                let instance = self.instance(r.plugin_context.instance_settings)?;
                json_response(&instance.get_node_list(Utc::now()).await?)?
            }
            "sk" => {
                let instance = self.instance(r.plugin_context.instance_settings)?;
                json_response(&instance.signing_key(Utc::now()).await?)?
            }
            _ => return Err(ResourceError::NotFound(path)),
        };
        Ok((response, Box::pin(futures_util::stream::empty()) as Self::Stream))
    }
}
