/*! A Grafana backend data source for [SolarNetwork] datum.

The plugin signs every request with the SNWS2 scheme, turns dashboard queries
into datum list or datum reading requests, and reshapes the returned datum
into one frame per node/source series.

The crate is split along the request path:

- [`environment`] resolves the configured API host and optional caching proxy.
- [`signing_key`] issues and caches the day-scoped signing key, which
  [`auth`] uses to sign requests.
- [`planner`] turns a [`QueryTarget`] into a [`QueryPlan`]: a [`DatumFilter`]
  plus the identity its results are keyed by.
- [`executor`] signs requests and sends them through a [`Transport`].
- [`reshape`] groups datum rows into column-oriented [`SeriesFrame`]s.
- [`datasource`] ties these together in an [`Instance`] and exposes them to
  Grafana through [`SolarNetworkDatasource`].

[SolarNetwork]: https://solarnetwork.github.io/
*/
#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod datasource;
pub mod domain;
pub mod environment;
pub mod error;
pub mod executor;
pub mod filter;
pub mod planner;
pub mod reshape;
pub mod signing_key;

pub use config::{DatasourceSettings, JsonData, SecureJsonData};
pub use datasource::{Instance, QueryRange, SolarNetworkDatasource};
pub use environment::Environment;
pub use error::{Error, Result};
pub use executor::{Datum, ReqwestTransport, RequestExecutor, Transport};
pub use filter::DatumFilter;
pub use planner::{QueryPlan, QueryTarget};
pub use reshape::SeriesFrame;
pub use signing_key::{KeyIssuer, SigningKey, SigningKeyCache};
