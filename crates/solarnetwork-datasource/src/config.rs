//! Data source instance configuration.

use std::fmt;

use serde::Deserialize;

use crate::{environment::Environment, Error, Result};

/// The non-secret settings saved by the configuration editor.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonData {
    /// The SolarNetwork API token.
    pub token: String,
    /// The SolarNetwork API URL; defaults to [`crate::environment::DEFAULT_HOST`].
    pub host: Option<String>,
    /// An optional caching proxy URL, such as [`crate::environment::PROXY_URL_1M`].
    pub proxy: Option<String>,
}

/// A secret that never appears in `Debug` output.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// The decrypted secure settings. Grafana only ever sends these to the backend.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SecureJsonData {
    /// The API token secret.
    pub secret: Option<Secret>,
}

/// Validated settings for one data source instance.
#[derive(Clone, Debug)]
pub struct DatasourceSettings {
    /// The trimmed API token.
    pub token: String,
    /// The API token secret.
    pub secret: Secret,
    /// Where requests are sent and who they are signed for.
    pub environment: Environment,
}

impl DatasourceSettings {
    /// Validate the raw instance settings.
    pub fn from_parts(json: &JsonData, secure: &SecureJsonData) -> Result<Self> {
        let token = json.token.trim();
        if token.is_empty() {
            return Err(Error::MissingToken);
        }
        let secret = secure
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingSecret)?;
        let environment = Environment::resolve(json.host.as_deref(), json.proxy.as_deref())?;
        Ok(Self {
            token: token.to_string(),
            secret,
            environment,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn secure(secret: &str) -> SecureJsonData {
        SecureJsonData {
            secret: Some(Secret::new(secret)),
        }
    }

    #[test]
    fn json_data_defaults() {
        let json: JsonData = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(
            json,
            JsonData {
                token: "abc".to_string(),
                host: None,
                proxy: None,
            }
        );
        let settings = DatasourceSettings::from_parts(&json, &secure("s")).unwrap();
        assert_eq!(settings.environment, Environment::default());
    }

    #[test]
    fn secret_is_redacted() {
        let secure: SecureJsonData = serde_json::from_str(r#"{"secret":"hunter2"}"#).unwrap();
        assert_eq!(secure.secret.as_ref().map(Secret::expose), Some("hunter2"));
        let debug = format!("{secure:?}");
        assert!(!debug.contains("hunter2"), "{debug}");
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let json = JsonData::default();
        assert!(matches!(
            DatasourceSettings::from_parts(&json, &secure("s")),
            Err(Error::MissingToken)
        ));
        let json = JsonData {
            token: "tok".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            DatasourceSettings::from_parts(&json, &SecureJsonData::default()),
            Err(Error::MissingSecret)
        ));
        assert!(matches!(
            DatasourceSettings::from_parts(&json, &secure("")),
            Err(Error::MissingSecret)
        ));
    }

    #[test]
    fn bad_urls_are_rejected() {
        let json = JsonData {
            token: "tok".to_string(),
            proxy: Some("https://exa mple.com/1m".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            DatasourceSettings::from_parts(&json, &secure("s")),
            Err(Error::InvalidUrl { .. })
        ));
    }
}
