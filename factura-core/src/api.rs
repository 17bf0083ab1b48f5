//! DIAN web service client and the normalized verdict it returns.
pub mod response;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Datelike, Utc};
use quick_xml::escape::escape;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{Config, EnvironmentType},
    document::DocumentType,
    tenant::TenantFiscalConfig,
};
use response::DianResponse;

const SOAP_ACTION_BASE: &str = "http://wcf.dian.colombia/IWcfDianCustomerServices/";
const SEND_BILL_SYNC_TEMPLATE: &str = include_str!("../assets/templates/send_bill_sync.xml");
const GET_STATUS_ZIP_TEMPLATE: &str = include_str!("../assets/templates/get_status_zip.xml");
const GET_STATUS_TEMPLATE: &str = include_str!("../assets/templates/get_status.xml");

/// Messages carrying this marker are informational and never block acceptance.
const NOTIFICATION_MARKER: &str = "Notificación";

/// Errors building the gateway. Round trips never fail, they return a [`Verdict`].
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Normalized outcome of one round trip to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    /// `None` when the authority did not pronounce on validity.
    pub is_valid: Option<bool>,
    pub status_code: String,
    pub description: String,
    pub track_id: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// The authority could not be reached, or answered with a non-2xx status.
    #[serde(default)]
    pub transport_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl Verdict {
    pub fn transport_failure(status_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            success: false,
            is_valid: None,
            status_code: status_code.into(),
            description: description.into(),
            track_id: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            transport_failure: true,
            raw_response: None,
        }
    }

    /// Normalize a parsed reply. Success requires an explicit `IsValid=true`.
    pub fn from_response(response: DianResponse, raw: String) -> Self {
        let (warnings, errors): (Vec<String>, Vec<String>) = response
            .messages
            .into_iter()
            .partition(|message| message.contains(NOTIFICATION_MARKER));
        let status_code = response
            .status_code
            .or_else(|| response.fault.as_ref().map(|_| "FAULT".to_string()))
            .unwrap_or_default();
        let description = response
            .status_description
            .or(response.fault)
            .or(response.status_message)
            .unwrap_or_default();

        Self {
            success: response.is_valid == Some(true),
            is_valid: response.is_valid,
            status_code,
            description,
            track_id: response.zip_key.or(response.xml_document_key),
            errors,
            warnings,
            transport_failure: false,
            raw_response: Some(raw),
        }
    }

    pub fn joined_errors(&self) -> String {
        self.errors.join("; ")
    }
}

/// Lookup key for a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQuery<'a> {
    /// Track ID returned by an earlier submission (`GetStatusZip`).
    TrackId(&'a str),
    /// The document's CUFE/CUDE (`GetStatus`).
    Identifier(&'a str),
}

/// Round trips to the tax authority.
///
/// Implementations make one attempt per call and report every failure inside
/// the returned [`Verdict`].
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    async fn submit(&self, config: &TenantFiscalConfig, signed_xml: &str, file_name: &str)
    -> Verdict;

    async fn check_status(&self, config: &TenantFiscalConfig, query: StatusQuery<'_>) -> Verdict;
}

/// File name DIAN expects for a submitted document:
/// `{fv|nc|nd}{nit:0>10}000{yy}{sequence:08x}.xml`.
pub fn document_file_name(
    nit: &str,
    kind: DocumentType,
    sequence: u64,
    issued_at: DateTime<Utc>,
) -> String {
    format!(
        "{}{:0>10}000{:02}{:08x}.xml",
        kind.file_prefix(),
        nit,
        issued_at.year() % 100,
        sequence
    )
}

/// SOAP client for `WcfDianCustomerServices`.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::api::DianClient;
/// use factura_core::config::Config;
///
/// let client = DianClient::new(Config::default())?;
/// # let _ = client;
/// # Ok::<(), factura_core::api::GatewayError>(())
/// ```
#[derive(Debug)]
pub struct DianClient {
    config: Config,
    client: Client,
}

impl DianClient {
    /// # Errors
    /// Returns [`GatewayError::Http`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl SubmissionGateway for DianClient {
    #[tracing::instrument(name = "dian.submit", skip(self, config, signed_xml), fields(tenant = %config.tenant_id))]
    async fn submit(
        &self,
        config: &TenantFiscalConfig,
        signed_xml: &str,
        file_name: &str,
    ) -> Verdict {
        let content = Base64::encode_string(signed_xml.as_bytes());
        let endpoint = self.config.endpoint(config.environment);
        let envelope = render_envelope(
            SEND_BILL_SYNC_TEMPLATE,
            "SendBillSync",
            endpoint,
            &[("file_name", file_name), ("content_file", content.as_str())],
        );
        self.round_trip(config.environment, "SendBillSync", envelope)
            .await
    }

    #[tracing::instrument(name = "dian.check_status", skip(self, config), fields(tenant = %config.tenant_id))]
    async fn check_status(&self, config: &TenantFiscalConfig, query: StatusQuery<'_>) -> Verdict {
        let (template, action, key) = match query {
            StatusQuery::TrackId(track_id) => (GET_STATUS_ZIP_TEMPLATE, "GetStatusZip", track_id),
            StatusQuery::Identifier(identifier) => (GET_STATUS_TEMPLATE, "GetStatus", identifier),
        };
        let endpoint = self.config.endpoint(config.environment);
        let envelope = render_envelope(template, action, endpoint, &[("track_id", key)]);
        self.round_trip(config.environment, action, envelope).await
    }
}

// Private API
impl DianClient {
    async fn round_trip(&self, env: EnvironmentType, action: &str, envelope: String) -> Verdict {
        let url = self.config.endpoint(env);
        tracing::debug!(%url, action, env = env.as_str(), "calling DIAN");

        let result = self
            .client
            .post(url)
            .header(
                "Content-Type",
                format!("application/soap+xml;charset=UTF-8;action=\"{SOAP_ACTION_BASE}{action}\""),
            )
            .body(envelope)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => return self.transport_verdict(action, &err),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return self.transport_verdict(action, &err),
        };

        if !status.is_success() {
            let description = DianResponse::parse(&body)
                .ok()
                .and_then(|parsed| parsed.fault)
                .unwrap_or_else(|| format!("HTTP {status}"));
            tracing::warn!(action, status = status.as_u16(), %description, "DIAN answered with an error status");
            let mut verdict = Verdict::transport_failure(status.as_u16().to_string(), description);
            verdict.raw_response = Some(body);
            return verdict;
        }

        match DianResponse::parse(&body) {
            Ok(parsed) => Verdict::from_response(parsed, body),
            Err(err) => {
                tracing::warn!(action, error = %err, "unreadable DIAN response");
                Verdict {
                    success: false,
                    is_valid: None,
                    status_code: "UNREADABLE".into(),
                    description: err.to_string(),
                    track_id: None,
                    errors: Vec::new(),
                    warnings: Vec::new(),
                    transport_failure: false,
                    raw_response: Some(body),
                }
            }
        }
    }

    fn transport_verdict(&self, action: &str, err: &reqwest::Error) -> Verdict {
        let verdict = if err.is_timeout() {
            Verdict::transport_failure(
                "TIMEOUT",
                format!(
                    "no answer from DIAN within {}s",
                    self.config.timeout().as_secs_f32()
                ),
            )
        } else {
            Verdict::transport_failure("TRANSPORT", format!("could not reach DIAN: {err}"))
        };
        tracing::warn!(action, code = %verdict.status_code, error = %err, "DIAN round trip failed");
        verdict
    }
}

fn render_envelope(
    template: &str,
    action: &str,
    endpoint: &str,
    values: &[(&str, &str)],
) -> String {
    let action_uri = format!("{SOAP_ACTION_BASE}{action}");
    let mut envelope = template
        .replace("{{action}}", &escape(action_uri.as_str()))
        .replace("{{endpoint}}", &escape(endpoint));
    for (name, value) in values {
        envelope = envelope.replace(&format!("{{{{{name}}}}}"), &escape(*value));
    }
    envelope
}
