//! Paddle API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use creditline_core::UserId;
use creditline_engine::{BillingProvider, ProviderError, ProviderSubscription, ProviderTransaction};

use super::types::{
    CreateCustomer, CustomData, Customer, PaddleEntity, PaddleErrorResponse, PaddleList,
    Subscription, Transaction,
};

/// Paddle API client.
#[derive(Debug, Clone)]
pub struct PaddleClient {
    client: Client,
    base_url: String,
    api_key: String,
}

fn http_error(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Decode(err.to_string())
    } else {
        ProviderError::Http(err.to_string())
    }
}

impl PaddleClient {
    /// Create a new Paddle client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Paddle API URL (e.g., `"https://sandbox-api.paddle.com"`)
    /// * `api_key` - Paddle API key
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(http_error)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Find a customer by email.
    pub async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, ProviderError> {
        let url = format!("{}/customers", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("email", email)])
            .send()
            .await
            .map_err(http_error)?;

        self.handle_response::<PaddleList<Customer>>(response)
            .await
            .map(|list| list.data.into_iter().next())
    }

    /// Create a customer carrying our user id in `custom_data`.
    pub async fn create_customer(
        &self,
        user_id: &UserId,
        email: &str,
    ) -> Result<Customer, ProviderError> {
        let url = format!("{}/customers", self.base_url);
        let request = CreateCustomer {
            email,
            custom_data: CustomData {
                user_id: Some(user_id.to_string()),
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;

        self.handle_response::<PaddleEntity<Customer>>(response)
            .await
            .map(|r| r.data)
    }

    /// List a customer's active and trialing subscriptions.
    pub async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Subscription>, ProviderError> {
        let url = format!("{}/subscriptions", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("customer_id", customer_id), ("status", "active,trialing")])
            .send()
            .await
            .map_err(http_error)?;

        self.handle_response::<PaddleList<Subscription>>(response)
            .await
            .map(|list| list.data)
    }

    /// Fetch the most recently billed transaction of a subscription.
    pub async fn latest_subscription_transaction(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Transaction>, ProviderError> {
        let url = format!("{}/transactions", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("subscription_id", subscription_id),
                ("order_by", "billed_at[DESC]"),
                ("per_page", "1"),
            ])
            .send()
            .await
            .map_err(http_error)?;

        self.handle_response::<PaddleList<Transaction>>(response)
            .await
            .map(|list| list.data.into_iter().next())
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()));
        }

        let error_body: Result<PaddleErrorResponse, _> = response.json().await;

        match error_body {
            Ok(paddle_error) => Err(ProviderError::Status {
                status: status.as_u16(),
                message: format!("{}: {}", paddle_error.error.code, paddle_error.error.detail),
            }),
            Err(_) => Err(ProviderError::Status {
                status: status.as_u16(),
                message: format!("HTTP {status}"),
            }),
        }
    }
}

#[async_trait]
impl BillingProvider for PaddleClient {
    async fn find_or_create_customer(
        &self,
        user_id: &UserId,
        email: Option<&str>,
    ) -> Result<String, ProviderError> {
        let email = email.ok_or_else(|| {
            ProviderError::UnresolvableCustomer(format!("no email on file for user {user_id}"))
        })?;

        if let Some(customer) = self.find_customer_by_email(email).await? {
            tracing::debug!(user_id = %user_id, customer_id = %customer.id, "Found Paddle customer");
            return Ok(customer.id);
        }

        let customer = self.create_customer(user_id, email).await?;
        tracing::info!(user_id = %user_id, customer_id = %customer.id, "Created Paddle customer");
        Ok(customer.id)
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError> {
        let subscriptions = self.list_subscriptions(customer_id).await?;
        Ok(subscriptions.into_iter().map(Into::into).collect())
    }

    async fn latest_transaction(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderTransaction>, ProviderError> {
        let transaction = self.latest_subscription_transaction(subscription_id).await?;
        Ok(transaction.map(Into::into))
    }
}
