use crate::summary::RunSummary;
use modbot_core::{CoreError, NotifySettings};
use std::time::Duration;
use tracing::{error, info};

/// Receives the summary of runs that had errors.
pub trait Notifier {
    async fn notify(&self, summary: &RunSummary) -> Result<(), CoreError>;
}

/// Emits the failures as `tracing` error events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) -> Result<(), CoreError> {
        error!(
            run_id = %summary.run_id,
            failures = summary.errors.len(),
            "Run finished with errors: {}",
            summary
        );
        for failure in &summary.errors {
            error!(
                run_id = %summary.run_id,
                stage = %failure.stage,
                code = %failure.error_code,
                "{}: {}",
                failure.item,
                failure.message
            );
        }
        Ok(())
    }
}

/// POSTs the summary as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &RunSummary) -> Result<(), CoreError> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Notification {
                message: format!("webhook answered {status}"),
            });
        }
        info!("Sent failure report for run {} to webhook", summary.run_id);
        Ok(())
    }
}

/// Notifier chosen from `[notify]` settings: webhook when a URL is set.
pub enum RunNotifier {
    Log(LogNotifier),
    Webhook(WebhookNotifier),
}

impl RunNotifier {
    pub fn from_settings(settings: &NotifySettings) -> Result<Self, CoreError> {
        match settings.webhook_url.as_deref().filter(|url| !url.is_empty()) {
            Some(url) => Ok(RunNotifier::Webhook(WebhookNotifier::new(url)?)),
            None => Ok(RunNotifier::Log(LogNotifier)),
        }
    }
}

impl Notifier for RunNotifier {
    async fn notify(&self, summary: &RunSummary) -> Result<(), CoreError> {
        match self {
            RunNotifier::Log(notifier) => notifier.notify(summary).await,
            RunNotifier::Webhook(notifier) => notifier.notify(summary).await,
        }
    }
}
