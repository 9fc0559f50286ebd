//! Application state.

use std::sync::Arc;

use creditline_core::PlanCatalog;
use creditline_engine::{
    BillingEventProcessor, BillingProvider, CreditService, JobTracker, NoopNotifier, Notifier,
    Reconciler,
};
use creditline_store::Store;

use crate::config::ServiceConfig;
use crate::notify::HttpNotifier;
use crate::paddle::PaddleClient;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit service (the only balance writer).
    pub credits: Arc<CreditService>,

    /// Job lifecycle tracker.
    pub jobs: JobTracker,

    /// Read-path reconciliation sweep.
    pub reconciler: Reconciler,

    /// Webhook event processor.
    pub events: BillingEventProcessor,

    /// Price id to credits mapping.
    pub catalog: Arc<PlanCatalog>,

    has_provider: bool,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let credits = Arc::new(CreditService::new(store, config.retry_policy()));
        let catalog = Arc::new(config.plan_catalog.clone());

        // Create Paddle client if configured
        let provider: Option<Arc<dyn BillingProvider>> =
            config.paddle_api_key.as_ref().and_then(|key| {
                match PaddleClient::new(&config.paddle_api_url, key) {
                    Ok(client) => {
                        tracing::info!(paddle_url = %config.paddle_api_url, "Paddle integration enabled");
                        Some(Arc::new(client) as Arc<dyn BillingProvider>)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to create Paddle client");
                        None
                    }
                }
            });

        if provider.is_none() {
            tracing::warn!("Paddle not configured - balances will not be reconciled");
        }

        if config.paddle_webhook_secret.is_none() {
            tracing::warn!("PADDLE_WEBHOOK_SECRET not set - webhook signatures will not be verified");
        }

        // Create notifier if configured
        let notifier: Arc<dyn Notifier> = match config.notify_url.as_deref() {
            Some(url) => match HttpNotifier::new(url) {
                Ok(notifier) => {
                    tracing::info!(notify_url = %url, "Job notifications enabled");
                    Arc::new(notifier)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create notifier");
                    Arc::new(NoopNotifier)
                }
            },
            None => Arc::new(NoopNotifier),
        };

        Self::with_components(credits, config, provider, notifier, catalog)
    }

    /// Assemble state from prebuilt parts. Tests use this to inject fakes.
    #[must_use]
    pub fn with_components(
        credits: Arc<CreditService>,
        config: ServiceConfig,
        provider: Option<Arc<dyn BillingProvider>>,
        notifier: Arc<dyn Notifier>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        let has_provider = provider.is_some();
        let jobs = JobTracker::new(Arc::clone(&credits), notifier);
        let reconciler = Reconciler::new(
            Arc::clone(&credits),
            provider,
            Arc::clone(&catalog),
            config.sync_stale_after(),
        );
        let events = BillingEventProcessor::new(Arc::clone(&credits), Arc::clone(&catalog));

        Self {
            config,
            credits,
            jobs,
            reconciler,
            events,
            catalog,
            has_provider,
        }
    }

    /// Check if a billing provider is configured.
    #[must_use]
    pub fn has_provider(&self) -> bool {
        self.has_provider
    }
}
