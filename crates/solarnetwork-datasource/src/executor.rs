//! Signing and performing SolarNetwork API requests.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use grafana_plugin_sdk::backend::async_trait;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    auth::{self, SignableRequest},
    domain::DatumReadingType,
    environment::Environment,
    filter::{ApiRequest, DatumFilter},
    signing_key::{KeyIssuer, SigningKeyCache},
    Error, Result,
};

/// The number of datum requested per page of a list query.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// A fully signed GET request.
#[derive(Clone, Debug)]
pub struct SignedRequest {
    /// The URL to send the request to, which may be a proxy.
    pub url: String,
    /// The date and authorization headers.
    pub headers: HeaderMap,
}

/// Performs signed requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the body of a successful response.
    ///
    /// Non-2xx responses must be reported as [`Error::Status`].
    async fn get(&self, request: SignedRequest) -> Result<Bytes>;
}

/// A [`Transport`] backed by a shared `reqwest` client.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Use `client` for every request.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(url = %request.url))]
    async fn get(&self, request: SignedRequest) -> Result<Bytes> {
        let transport_error = |e: reqwest::Error| Error::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        };
        let response = self
            .client
            .get(&request.url)
            .headers(request.headers.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            warn!(%status, "SolarNetwork request failed");
            return Err(Error::Status {
                status,
                message: status_message(status, &body),
            });
        }
        Ok(body)
    }
}

/// The best description of a failed response: the API's own message if the
/// body is an envelope carrying one, else the standard status text.
pub(crate) fn status_message(status: StatusCode, body: &[u8]) -> String {
    serde_json::from_slice::<Envelope<serde::de::IgnoredAny>>(body)
        .ok()
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string())
}

/// One row returned by the datum list or datum reading APIs.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datum {
    /// The node the datum was collected by.
    pub node_id: i64,
    /// The source the datum was collected from.
    pub source_id: String,
    /// Every other property: timestamps and metric values.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope<D> {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    data: Option<D>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatumPage {
    #[serde(default)]
    total_results: Option<usize>,
    results: Vec<Datum>,
}

/// Signs requests with the cached signing key and sends them through a [`Transport`].
#[derive(Debug)]
pub struct RequestExecutor<T, I> {
    transport: T,
    keys: SigningKeyCache<I>,
    environment: Environment,
    token: String,
    page_size: usize,
    clock: fn() -> DateTime<Utc>,
}

impl<T, I> RequestExecutor<T, I>
where
    T: Transport,
    I: KeyIssuer,
{
    /// Create an executor signing as `token` with keys from `keys`.
    pub fn new(
        transport: T,
        keys: SigningKeyCache<I>,
        environment: Environment,
        token: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            keys,
            environment,
            token: token.into(),
            page_size: DEFAULT_PAGE_SIZE,
            clock: Utc::now,
        }
    }

    /// Read the time from `clock` when signing follow-up requests.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Request list results in pages of `page_size` rows.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The addressing requests are built with.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// The transport requests are sent through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The signing key cache.
    pub fn keys(&self) -> &SigningKeyCache<I> {
        &self.keys
    }

    /// Sign `request` as made at `now`, refreshing the signing key first if
    /// it was issued on an earlier day.
    pub async fn sign(&self, request: &ApiRequest, now: DateTime<Utc>) -> Result<SignedRequest> {
        let key = self.keys.key(now).await?;
        let url = self.environment.url_for(request);
        let host = self.environment.host().authority();
        let query = request.query_string();
        let authorization = SignableRequest {
            host: &host,
            path: request.path,
            query: &query,
            date: now,
        }
        .authorization(&self.token, key.material());

        let header_value = |value: String| {
            HeaderValue::from_str(&value).map_err(|e| Error::Transport {
                url: url.clone(),
                message: e.to_string(),
            })
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, header_value(authorization)?);
        headers.insert(
            HeaderName::from_static(auth::X_SN_DATE),
            header_value(auth::http_date(now))?,
        );
        Ok(SignedRequest { url, headers })
    }

    async fn fetch<D: DeserializeOwned>(&self, request: &ApiRequest, now: DateTime<Utc>) -> Result<D> {
        let signed = self.sign(request, now).await?;
        debug!(url = %signed.url, "Requesting");
        let body = self.transport.get(signed).await?;
        let envelope: Envelope<D> = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        if !envelope.success {
            return Err(Error::Api(
                envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| Error::MalformedResponse("response has no data".to_string()))
    }

    /// Every node id the token can access.
    pub async fn list_all_node_ids(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        self.fetch(&ApiRequest::list_all_node_ids(), now).await
    }

    /// Every datum matching `filter`, loaded a page at a time and returned in
    /// page order.
    ///
    /// The first page is signed at `now` and later pages at the time they are
    /// requested.
    pub async fn list_datum(&self, filter: &DatumFilter, now: DateTime<Utc>) -> Result<Vec<Datum>> {
        let mut rows = Vec::new();
        let mut signed_at = now;
        loop {
            let request = ApiRequest::list_datum(&filter.page(self.page_size, rows.len()));
            let page: DatumPage = self.fetch(&request, signed_at).await?;
            let returned = page.results.len();
            rows.extend(page.results);
            let complete = page.total_results.is_some_and(|total| rows.len() >= total);
            if returned < self.page_size || complete {
                break;
            }
            signed_at = (self.clock)().max(now);
        }
        debug!(rows = rows.len(), "Loaded datum list");
        Ok(rows)
    }

    /// Readings of `reading_type` for datum matching `filter`.
    pub async fn datum_reading(
        &self,
        reading_type: DatumReadingType,
        filter: &DatumFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<Datum>> {
        let page: DatumPage = self
            .fetch(&ApiRequest::datum_reading(reading_type, filter), now)
            .await?;
        Ok(page.results)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::signing_key::tests::CountingIssuer;

    type Responder = Box<dyn Fn(&SignedRequest) -> Result<Bytes> + Send + Sync>;

    /// Answers requests with a closure and remembers every request it saw.
    pub(crate) struct FakeTransport {
        respond: Responder,
        pub(crate) requests: Mutex<Vec<SignedRequest>>,
    }

    impl FakeTransport {
        pub(crate) fn new(
            respond: impl Fn(&SignedRequest) -> Result<Bytes> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, request: SignedRequest) -> Result<Bytes> {
            let response = (self.respond)(&request);
            self.requests.lock().unwrap().push(request);
            response
        }
    }

    /// A successful envelope around `data`.
    pub(crate) fn ok(data: Value) -> Result<Bytes> {
        Ok(Bytes::from(
            json!({ "success": true, "data": data }).to_string(),
        ))
    }

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    fn executor(
        transport: FakeTransport,
        proxy: Option<&str>,
    ) -> RequestExecutor<FakeTransport, CountingIssuer> {
        RequestExecutor::new(
            transport,
            SigningKeyCache::new(CountingIssuer::default()),
            Environment::resolve(None, proxy).unwrap(),
            "tok",
        )
        .with_clock(now)
    }

    fn datum(i: usize) -> Value {
        json!({ "nodeId": 1, "sourceId": "A", "created": "2024-01-01 00:00:00.000Z", "watts": i })
    }

    #[tokio::test]
    async fn sign_adds_date_and_authorization() {
        let ex = executor(FakeTransport::new(|_| ok(json!([]))), None);
        let signed = ex.sign(&ApiRequest::list_all_node_ids(), now()).await.unwrap();
        assert_eq!(
            signed.url,
            "https://data.solarnetwork.net/solarquery/api/v1/sec/nodes"
        );
        assert_eq!(signed.headers["x-sn-date"], "Tue, 02 Jan 2024 03:04:05 GMT");
        let authorization = signed.headers[header::AUTHORIZATION].to_str().unwrap();
        assert!(authorization.starts_with("SNWS2 Credential=tok,SignedHeaders=host;x-sn-date,Signature="));
    }

    #[tokio::test]
    async fn proxied_requests_are_signed_for_the_api_host() {
        let direct = executor(FakeTransport::new(|_| ok(json!([]))), None);
        let proxied = executor(
            FakeTransport::new(|_| ok(json!([]))),
            Some(crate::environment::PROXY_URL_10M),
        );
        let request = ApiRequest::list_all_node_ids();
        let a = direct.sign(&request, now()).await.unwrap();
        let b = proxied.sign(&request, now()).await.unwrap();
        assert_eq!(
            b.url,
            "https://query.solarnetwork.net/10m/solarquery/api/v1/sec/nodes"
        );
        assert_eq!(a.headers[header::AUTHORIZATION], b.headers[header::AUTHORIZATION]);
    }

    #[tokio::test]
    async fn node_ids_are_unwrapped_from_envelope() {
        let ex = executor(FakeTransport::new(|_| ok(json!([3, 1, 2]))), None);
        assert_eq!(ex.list_all_node_ids(now()).await.unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_an_api_error() {
        let ex = executor(
            FakeTransport::new(|_| {
                Ok(Bytes::from_static(
                    br#"{"success":false,"message":"Access denied"}"#,
                ))
            }),
            None,
        );
        let err = ex.list_all_node_ids(now()).await.unwrap_err();
        assert!(matches!(&err, Error::Api(m) if m == "Access denied"), "{err}");
    }

    #[tokio::test]
    async fn malformed_envelopes_are_errors() {
        let ex = executor(FakeTransport::new(|_| Ok(Bytes::from_static(b"<html>"))), None);
        assert!(matches!(
            ex.list_all_node_ids(now()).await,
            Err(Error::MalformedResponse(_))
        ));

        let ex = executor(FakeTransport::new(|_| ok(json!({ "totalResults": 1 }))), None);
        assert!(matches!(
            ex.list_datum(&DatumFilter::default(), now()).await,
            Err(Error::MalformedResponse(_))
        ));

        let ex = executor(
            FakeTransport::new(|_| Ok(Bytes::from_static(br#"{"success":true}"#))),
            None,
        );
        assert!(matches!(
            ex.list_all_node_ids(now()).await,
            Err(Error::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn list_datum_follows_pages() {
        let ex = executor(
            FakeTransport::new(|request| {
                let rows: Vec<Value> = if request.url.contains("offset=0") {
                    (0..2).map(datum).collect()
                } else if request.url.contains("offset=2") {
                    (2..4).map(datum).collect()
                } else {
                    (4..5).map(datum).collect()
                };
                ok(json!({ "totalResults": 5, "results": rows }))
            }),
            None,
        )
        .with_page_size(2);
        let rows = ex
            .list_datum(
                &DatumFilter {
                    node_ids: vec![1],
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap();
        let watts: Vec<_> = rows.iter().map(|d| d.fields["watts"].clone()).collect();
        assert_eq!(watts, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        let urls = ex.transport.urls();
        assert_eq!(urls.len(), 3);
        assert!(urls[2].contains("max=2&nodeIds=1&offset=4"), "{}", urls[2]);
        // One key serves every page.
        assert_eq!(ex.keys().issuer().fetches(), 1);
    }

    #[tokio::test]
    async fn later_pages_are_signed_when_requested() {
        fn later() -> DateTime<Utc> {
            now() + chrono::Duration::minutes(20)
        }
        let ex = executor(
            FakeTransport::new(|request| {
                let rows: Vec<Value> = if request.url.contains("offset=0") {
                    (0..2).map(datum).collect()
                } else {
                    (2..3).map(datum).collect()
                };
                ok(json!({ "results": rows }))
            }),
            None,
        )
        .with_page_size(2)
        .with_clock(later);
        let rows = ex.list_datum(&DatumFilter::default(), now()).await.unwrap();
        assert_eq!(rows.len(), 3);
        let requests = ex.transport.requests.lock().unwrap();
        let dates: Vec<_> = requests
            .iter()
            .map(|r| r.headers["x-sn-date"].to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            dates,
            vec!["Tue, 02 Jan 2024 03:04:05 GMT", "Tue, 02 Jan 2024 03:24:05 GMT"]
        );
    }

    #[tokio::test]
    async fn signing_after_midnight_uses_a_new_key() {
        let ex = executor(FakeTransport::new(|_| ok(json!([]))), None);
        let request = ApiRequest::list_all_node_ids();
        let before = ex
            .sign(&request, Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap())
            .await
            .unwrap();
        let after = ex
            .sign(&request, Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(ex.keys().issuer().fetches(), 2);
        assert_ne!(
            before.headers[header::AUTHORIZATION],
            after.headers[header::AUTHORIZATION]
        );
    }

    #[tokio::test]
    async fn list_datum_stops_at_total_results() {
        let ex = executor(
            FakeTransport::new(|_| ok(json!({ "totalResults": 2, "results": [datum(0), datum(1)] }))),
            None,
        )
        .with_page_size(2);
        let rows = ex.list_datum(&DatumFilter::default(), now()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(ex.transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn datum_reading_is_a_single_request() {
        let ex = executor(
            FakeTransport::new(|_| {
                ok(json!({ "results": [{ "nodeId": 1, "sourceId": "A", "endDate": "2024-01-02 00:00:00.000Z", "wattHours": 5 }] }))
            }),
            None,
        );
        let rows = ex
            .datum_reading(DatumReadingType::Difference, &DatumFilter::default(), now())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_id, "A");
        let urls = ex.transport.urls();
        assert_eq!(
            urls,
            vec!["https://data.solarnetwork.net/solarquery/api/v1/sec/datum/reading?readingType=Difference"]
        );
    }

    #[test]
    fn status_message_prefers_api_message() {
        assert_eq!(
            status_message(StatusCode::FORBIDDEN, br#"{"success":false,"message":"Bad token"}"#),
            "Bad token"
        );
        assert_eq!(status_message(StatusCode::FORBIDDEN, b""), "Forbidden");
    }
}
