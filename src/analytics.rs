use std::{fs, future::Future, path::Path};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::{report::RunReportRequest, settings::Analytics as AnalyticsSettings};

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ANALYTICS_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Refresh a little early so a token never expires mid-request.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Something that can run a GA4 report.
pub(crate) trait ReportClient {
    /// Returns the report JSON exactly as the upstream API produced it.
    fn run_report(&self, request: &RunReportRequest) -> impl Future<Output = Result<Value>> + Send;
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServiceAccountKey {
    pub(crate) client_email: String,
    pub(crate) private_key: String,
    #[serde(default = "default_token_uri")]
    pub(crate) token_uri: String,
    #[serde(default)]
    pub(crate) project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub(crate) fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read service account key {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid service account key {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl<'a> Claims<'a> {
    fn new(key: &'a ServiceAccountKey, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iss: &key.client_email,
            scope: ANALYTICS_SCOPE,
            aud: &key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn issued(response: TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        let expires_in = response.expires_in;
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .with_context(|| format!("token lifetime out of range: {expires_in}"))?;
        Ok(Self {
            value: response.access_token,
            expires_at,
        })
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Builds the error message for a failed upstream call.
///
/// Understands the Google API envelope `{"error": {"status", "message"}}` and
/// the OAuth form `{"error": "<code>", "error_description": "..."}`.
fn upstream_error(status: StatusCode, body: &str) -> anyhow::Error {
    let parsed = serde_json::from_str::<Value>(body).ok();
    match parsed.as_ref().and_then(|v| v.get("error")) {
        Some(Value::Object(error)) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match error.get("status").and_then(Value::as_str) {
                Some(code) => anyhow!("{code}: {message}"),
                None => anyhow!("{message}"),
            }
        }
        Some(Value::String(code)) => {
            let description = parsed
                .as_ref()
                .and_then(|v| v.get("error_description"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            anyhow!("{code}: {description}")
        }
        _ => anyhow!("{status}: {}", body.trim()),
    }
}

/// GA4 Data API client authenticated with a service account.
pub(crate) struct GoogleAnalytics {
    http: Client,
    endpoint: String,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    token: Mutex<Option<AccessToken>>,
}

impl GoogleAnalytics {
    pub(crate) fn new(settings: &AnalyticsSettings) -> Result<Self> {
        let key = ServiceAccountKey::from_file(&settings.credentials)?;
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("invalid private key in service account key")?;
        let http = Client::builder().user_agent(APP_USER_AGENT).build()?;
        let project = key.project_id.as_deref().unwrap_or("unknown project");
        info!("Using service account {} ({project})", key.client_email);
        Ok(Self {
            http,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            key,
            encoding_key,
            token: Mutex::new(None),
        })
    }

    fn report_url(&self, property: &str) -> String {
        format!("{}/{property}:runReport", self.endpoint)
    }

    async fn access_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = slot.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }
        let token = self.fetch_token(now).await?;
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    async fn fetch_token(&self, now: DateTime<Utc>) -> Result<AccessToken> {
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &Claims::new(&self.key, now),
            &self.encoding_key,
        )
        .context("failed to sign token request")?;
        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("token request failed")?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(status, &body).context("failed to obtain access token"));
        }
        let token: TokenResponse =
            serde_json::from_str(&body).context("unexpected token response")?;
        AccessToken::issued(token, now)
    }
}

impl ReportClient for GoogleAnalytics {
    fn run_report(
        &self,
        request: &RunReportRequest,
    ) -> impl Future<Output = Result<Value>> + Send {
        async move {
            let token = self.access_token().await?;
            let resp = self
                .http
                .post(self.report_url(&request.property))
                .bearer_auth(token)
                .json(request)
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(upstream_error(status, &body));
            }
            Ok(serde_json::from_str(&body)?)
        }
    }
}
