//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// Environment variable overriding the authority endpoint for every environment.
pub const BASE_URL_ENV: &str = "FACTURA_DIAN_BASE_URL";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// DIAN environment selection.
///
/// The flag decides which web service receives documents, which host the QR
/// verification URL points at, and it is also hashed into every CUFE/CUDE, so
/// test and production identifiers never collide.
/// - Test: what DIAN calls "habilitación".
/// - Production: the live service.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use factura_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("habilitacion")?;
/// assert_eq!(env, EnvironmentType::Test);
/// assert_eq!(env.identifier_code(), "2");
/// # Ok::<(), factura_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    #[default]
    Test,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "test" | "habilitacion" => Ok(EnvironmentType::Test),
            "production" | "produccion" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Production => "production",
        }
    }

    /// Value DIAN expects for `ProfileExecutionID` and the identifier hash.
    pub fn identifier_code(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "2",
            EnvironmentType::Production => "1",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://vpfe-hab.dian.gov.co/WcfDianCustomerServices.svc",
            EnvironmentType::Production => "https://vpfe.dian.gov.co/WcfDianCustomerServices.svc",
        }
    }

    pub fn verification_host(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://catalogo-vpfe-hab.dian.gov.co",
            EnvironmentType::Production => "https://catalogo-vpfe.dian.gov.co",
        }
    }
}

/// Configuration for the submission gateway.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use factura_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(Duration::from_secs(30))
///     .with_endpoint_override("http://127.0.0.1:8080/service.svc");
/// assert_eq!(config.endpoint(EnvironmentType::Production), "http://127.0.0.1:8080/service.svc");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    timeout: Duration,
    endpoint_override: Option<String>,
}

impl Config {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            endpoint_override: std::env::var(BASE_URL_ENV).ok(),
        }
    }

    pub fn with_endpoint_override(mut self, url: impl Into<String>) -> Self {
        self.endpoint_override = Some(url.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Service URL for the given environment, honoring any override.
    pub fn endpoint(&self, env: EnvironmentType) -> &str {
        self.endpoint_override
            .as_deref()
            .unwrap_or_else(|| env.endpoint_url())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(DEFAULT_TIMEOUT)
    }
}
