//! Error types returned by the datasource.

use chrono::NaiveDate;
use grafana_plugin_sdk::{backend, data};
use http::StatusCode;
use thiserror::Error;

/// Errors that can occur while configuring the datasource, signing requests,
/// talking to SolarNetwork or shaping its responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request did not come from a configured data source instance.
    #[error("missing data source instance settings")]
    MissingInstanceSettings,

    /// The instance has no API token configured.
    #[error("API token is missing")]
    MissingToken,

    /// The instance has no API token secret configured.
    #[error("API token secret is missing")]
    MissingSecret,

    /// A configured URL could not be parsed.
    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        /// The URL as configured.
        url: String,
        /// The underlying parse error.
        source: url::ParseError,
    },

    /// A configured URL parsed but did not name a host.
    #[error("URL {0:?} has no host")]
    MissingHost(String),

    /// The signing key could not be issued.
    #[error("error issuing signing key: {0}")]
    KeyIssuance(String),

    /// A freshly issued signing key was not valid for the current UTC day.
    #[error("signing key issued on {issued} is not valid on {today}")]
    StaleSigningKey {
        /// The UTC date the key was issued for.
        issued: NaiveDate,
        /// The current UTC date.
        today: NaiveDate,
    },

    /// The HTTP request could not be performed.
    #[error("error requesting {url}: {message}")]
    Transport {
        /// The URL that was requested.
        url: String,
        /// A description of the failure.
        message: String,
    },

    /// SolarNetwork answered with a non-success HTTP status.
    #[error("SolarNetwork returned {status}: {message}")]
    Status {
        /// The HTTP status code of the response.
        status: StatusCode,
        /// The status text or response body.
        message: String,
    },

    /// SolarNetwork answered with `success: false`.
    #[error("SolarNetwork request failed: {0}")]
    Api(String),

    /// The response JSON did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A datum carried a timestamp that could not be parsed.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// The query named an aggregation that does not exist.
    #[error("unknown aggregation {0:?}")]
    UnknownAggregation(String),

    /// The query named a combining type that does not exist.
    #[error("unknown combining type {0:?}")]
    UnknownCombiningType(String),

    /// The query named a datum reading type that does not exist.
    #[error("unknown datum reading type {0:?}")]
    UnknownReadingType(String),

    /// The query named a query type that does not exist.
    #[error("unknown query type {0:?}")]
    UnknownQueryType(String),

    /// A frame could not be built from the reshaped series.
    #[error("invalid frame: {0}")]
    Frame(#[from] data::Error),

    /// JSON could not be (de)serialized.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// A suitable query status for reporting this error to Grafana.
    pub fn status(&self) -> backend::DataQueryStatus {
        use backend::DataQueryStatus;
        match self {
            Self::MissingInstanceSettings
            | Self::MissingToken
            | Self::MissingSecret
            | Self::InvalidUrl { .. }
            | Self::MissingHost(_) => DataQueryStatus::ValidationFailed,
            Self::UnknownAggregation(_)
            | Self::UnknownCombiningType(_)
            | Self::UnknownReadingType(_)
            | Self::UnknownQueryType(_) => DataQueryStatus::BadRequest,
            Self::Status { status, .. } => match *status {
                StatusCode::UNAUTHORIZED => DataQueryStatus::Unauthorized,
                StatusCode::FORBIDDEN => DataQueryStatus::Forbidden,
                StatusCode::TOO_MANY_REQUESTS => DataQueryStatus::TooManyRequests,
                _ => DataQueryStatus::BadGateway,
            },
            Self::Transport { .. }
            | Self::Api(_)
            | Self::MalformedResponse(_)
            | Self::InvalidTimestamp(_) => DataQueryStatus::BadGateway,
            Self::KeyIssuance(_) | Self::StaleSigningKey { .. } | Self::Frame(_) | Self::Json(_) => {
                DataQueryStatus::Internal
            }
        }
    }

    /// Whether the error originated in the plugin or in SolarNetwork.
    pub fn error_source(&self) -> backend::ErrorSource {
        match self {
            Self::Transport { .. }
            | Self::Status { .. }
            | Self::Api(_)
            | Self::MalformedResponse(_)
            | Self::InvalidTimestamp(_) => backend::ErrorSource::Downstream,
            _ => backend::ErrorSource::Plugin,
        }
    }

    /// The HTTP status to use when this error answers a resource call.
    pub(crate) fn http_status(&self) -> StatusCode {
        match self {
            Self::MissingInstanceSettings
            | Self::MissingToken
            | Self::MissingSecret
            | Self::InvalidUrl { .. }
            | Self::MissingHost(_)
            | Self::UnknownAggregation(_)
            | Self::UnknownCombiningType(_)
            | Self::UnknownReadingType(_)
            | Self::UnknownQueryType(_) => StatusCode::BAD_REQUEST,
            Self::Status { status, .. } => *status,
            Self::Transport { .. }
            | Self::Api(_)
            | Self::MalformedResponse(_)
            | Self::InvalidTimestamp(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
