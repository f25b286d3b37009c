//! Addressing for the SolarNetwork API.
//!
//! An [`Environment`] separates the *identity* of the API host, which is bound
//! into every request signature, from the *address* requests are actually sent
//! to. The two differ when a caching proxy is configured: the proxy receives the
//! request but the signature must still be computed against the API host.

use url::Url;

use crate::{filter::ApiRequest, Error, Result};

/// The API host used when none is configured.
pub const DEFAULT_HOST: &str = "https://data.solarnetwork.net";

/// The SolarNetwork caching proxy with a one minute cache.
pub const PROXY_URL_1M: &str = "https://query.solarnetwork.net/1m";

/// The SolarNetwork caching proxy with a ten minute cache.
pub const PROXY_URL_10M: &str = "https://query.solarnetwork.net/10m";

const DEFAULT_SCHEME: &str = "https";

/// A scheme, hostname and optional non-default port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The URL scheme, e.g. `https`.
    pub scheme: String,
    /// The hostname, without port.
    pub hostname: String,
    /// The port, if it is not the default for `scheme`.
    pub port: Option<u16>,
}

impl Endpoint {
    /// The `host[:port]` form used in the `Host` header and in URLs.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }
}

/// A caching proxy that requests are routed through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    /// Where the proxy listens.
    pub endpoint: Endpoint,
    /// Path prepended to every API path, without a trailing slash.
    pub path_prefix: String,
}

/// Resolved addressing for one datasource instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    host: Endpoint,
    proxy: Option<Proxy>,
}

impl Environment {
    /// Resolve the configured host and proxy URLs.
    ///
    /// A missing or blank host falls back to [`DEFAULT_HOST`]; URLs without a
    /// scheme are assumed to be `https`. A missing or blank proxy means
    /// requests go straight to the host.
    pub fn resolve(host: Option<&str>, proxy: Option<&str>) -> Result<Self> {
        let host = match host.map(str::trim) {
            Some(h) if !h.is_empty() => h,
            _ => DEFAULT_HOST,
        };
        let (host, _) = parse_endpoint(host)?;
        let proxy = match proxy.map(str::trim) {
            Some(p) if !p.is_empty() => {
                let (endpoint, path) = parse_endpoint(p)?;
                Some(Proxy {
                    endpoint,
                    path_prefix: path.trim_end_matches('/').to_string(),
                })
            }
            _ => None,
        };
        Ok(Self { host, proxy })
    }

    /// The API host identity bound into request signatures.
    pub fn host(&self) -> &Endpoint {
        &self.host
    }

    /// The caching proxy, if one is configured.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Build the URL that `request` should be sent to.
    pub fn url_for(&self, request: &ApiRequest) -> String {
        let base = match &self.proxy {
            Some(proxy) => format!("{}{}", proxy.endpoint.base_url(), proxy.path_prefix),
            None => self.host.base_url(),
        };
        let query = request.query_string();
        if query.is_empty() {
            format!("{}{}", base, request.path)
        } else {
            format!("{}{}?{}", base, request.path, query)
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            host: Endpoint {
                scheme: DEFAULT_SCHEME.to_string(),
                hostname: "data.solarnetwork.net".to_string(),
                port: None,
            },
            proxy: None,
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<(Endpoint, String)> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{DEFAULT_SCHEME}://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|source| Error::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    let hostname = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::MissingHost(raw.to_string()))?;
    Ok((
        Endpoint {
            scheme: url.scheme().to_string(),
            hostname: hostname.to_string(),
            port: url.port(),
        },
        url.path().to_string(),
    ))
}
