//! Outbound alerting
//!
//! Two channels, a JSON webhook and SMTP mail, behind a per-type cooldown
//! so a flapping condition cannot page anyone twice in an hour.

use crate::config::{AlertsConfig, SmtpConfig};
use crate::error::{OptimizerError, Result};
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Needs attention soon
    Warning,
    /// Needs attention now
    Critical,
}

impl AlertSeverity {
    /// Display color used by webhook consumers.
    pub fn color(self) -> &'static str {
        match self {
            AlertSeverity::Info => "#36a64f",
            AlertSeverity::Warning => "#ffae42",
            AlertSeverity::Critical => "#d00000",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// One outbound alert
#[derive(Debug, Clone)]
pub struct Alert {
    /// Cooldown key; alerts of the same type share a cooldown window
    pub alert_type: String,
    /// Severity
    pub severity: AlertSeverity,
    /// Short title
    pub title: String,
    /// Body text
    pub message: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    severity: AlertSeverity,
    color: &'static str,
    title: &'a str,
    message: &'a str,
    timestamp: DateTime<Utc>,
}

/// Alert dispatcher with per-type cooldown
pub struct AlertManager {
    config: AlertsConfig,
    http: reqwest::Client,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertManager {
    /// Build a manager from configuration.
    pub fn new(config: AlertsConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an alert of this type is currently cooled down.
    pub fn is_cooled_down(&self, alert_type: &str) -> bool {
        let last_sent = self.last_sent.lock();
        last_sent
            .get(alert_type)
            .map(|t| t.elapsed() < self.config.cooldown())
            .unwrap_or(false)
    }

    /// Dispatch an alert to every configured channel.
    ///
    /// Returns `Ok(false)` when the alert was swallowed by its cooldown.
    /// Channel failures are logged per channel; the first failure is
    /// surfaced after all channels were tried.
    pub async fn send(&self, alert: &Alert) -> Result<bool> {
        if self.is_cooled_down(&alert.alert_type) {
            debug!(alert_type = %alert.alert_type, "alert suppressed by cooldown");
            return Ok(false);
        }
        self.last_sent
            .lock()
            .insert(alert.alert_type.clone(), Instant::now());

        let mut first_error: Option<OptimizerError> = None;
        if let Some(url) = &self.config.webhook_url {
            if let Err(e) = self.send_webhook(url, alert).await {
                warn!(error = %e, "webhook alert failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(smtp) = &self.config.smtp {
            if let Err(e) = self.send_mail(smtp, alert).await {
                warn!(error = %e, "smtp alert failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    alert_type = %alert.alert_type,
                    severity = alert.severity.label(),
                    "alert dispatched"
                );
                Ok(true)
            }
        }
    }

    async fn send_webhook(&self, url: &str, alert: &Alert) -> Result<()> {
        let payload = WebhookPayload {
            severity: alert.severity,
            color: alert.severity.color(),
            title: &alert.title,
            message: &alert.message,
            timestamp: Utc::now(),
        };
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OptimizerError::Alert(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OptimizerError::Alert(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_mail(&self, smtp: &SmtpConfig, alert: &Alert) -> Result<()> {
        let subject = format!("[KOptimizer] {}: {}", alert.severity.label(), alert.title);
        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .map_err(|e| OptimizerError::Alert(e.to_string()))?
            .port(smtp.port);
        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            transport = transport.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let mailer = transport.build();

        for recipient in &smtp.to {
            let email = Message::builder()
                .from(
                    smtp.from
                        .parse()
                        .map_err(|e| OptimizerError::Alert(format!("bad from address: {e}")))?,
                )
                .to(recipient
                    .parse()
                    .map_err(|e| OptimizerError::Alert(format!("bad recipient: {e}")))?)
                .subject(&subject)
                .header(ContentType::TEXT_PLAIN)
                .body(alert.message.clone())
                .map_err(|e| OptimizerError::Alert(e.to_string()))?;
            mailer
                .send(email)
                .await
                .map_err(|e| OptimizerError::Alert(e.to_string()))?;
        }
        Ok(())
    }
}
