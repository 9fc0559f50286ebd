//! Creditline HTTP client implementation.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};

use creditline_core::{GenerationJob, JobProgress, ProcessId, UserId};

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BalanceResponse, ProgressResponse, StartJobRequest, StartJobResponse,
};

/// Creditline API client for job executors.
///
/// Authenticates with a service API key. Every call maps the service's error
/// envelope onto [`ClientError`].
#[derive(Debug, Clone)]
pub struct CreditlineClient {
    client: Client,
    base_url: Url,
    api_key: String,
    service_name: String,
}

impl CreditlineClient {
    /// Create a new creditline client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the creditline service (e.g., `"http://creditline:8080"`)
    /// * `api_key` - Service API key for authentication
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the URL is invalid, or
    /// [`ClientError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a new creditline client with custom options.
    ///
    /// # Errors
    ///
    /// Same as [`CreditlineClient::new`].
    pub fn with_options(
        base_url: &str,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ClientError::Configuration(format!("invalid base url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Configuration(format!(
                "base url cannot carry a path: {base_url}"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            service_name: options.service_name,
        })
    }

    /// Start a job and reserve its credits.
    ///
    /// Starting the same process id twice is safe: the second call returns
    /// the existing job with `replayed` set and charges nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InsufficientCredits`] if the user cannot afford
    /// the job, or another error if the request fails.
    pub async fn start_job(
        &self,
        request: &StartJobRequest,
    ) -> Result<StartJobResponse, ClientError> {
        let url = self.endpoint(&["v1", "jobs"])?;
        tracing::debug!(process_id = %request.process_id, credits = request.credits, "Starting job");

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Report progress for a running job.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the job was never started, or
    /// another error if the request fails.
    pub async fn report_progress(
        &self,
        process_id: &ProcessId,
        progress: &JobProgress,
    ) -> Result<ProgressResponse, ClientError> {
        let url = self.endpoint(&["v1", "jobs", process_id.as_str(), "progress"])?;

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .json(progress)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a job.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the job does not exist.
    pub async fn get_job(&self, process_id: &ProcessId) -> Result<GenerationJob, ClientError> {
        let url = self.endpoint(&["v1", "jobs", process_id.as_str()])?;

        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a user's balance.
    ///
    /// The service reconciles against the billing provider first when the
    /// cached balance looks stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<BalanceResponse, ClientError> {
        let user_id = user_id.to_string();
        let url = self.endpoint(&["v1", "users", &user_id, "balance"])?;

        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .send()
            .await?;

        self.handle_response(response).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Configuration("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(service = %self.service_name, "Creditline rejected the service API key");
            return Err(ClientError::Unauthorized);
        }

        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        match error_body {
            Ok(api_error) => {
                let details = api_error.error.details.as_ref();
                let detail = |key: &str| {
                    details
                        .and_then(|d| d.get(key))
                        .and_then(serde_json::Value::as_i64)
                        .unwrap_or(0)
                };

                match api_error.error.code.as_str() {
                    "insufficient_credits" => Err(ClientError::InsufficientCredits {
                        balance: detail("balance"),
                        required: detail("required"),
                    }),
                    "not_found" => Err(ClientError::NotFound(api_error.error.message)),
                    code => Err(ClientError::Api {
                        code: code.to_string(),
                        message: api_error.error.message,
                        status: status.as_u16(),
                    }),
                }
            }
            Err(_) => Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
    /// Service name sent with every request.
    pub service_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            service_name: "unknown".to_string(),
        }
    }
}

impl ClientOptions {
    /// Create options with a service name.
    #[must_use]
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }
}
