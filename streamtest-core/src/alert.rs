//! Alert transports and their dispatch on health transitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{AlertsSection, DiscordSection, PagerDutySection};
use crate::error::ErrorKind;

const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";
const MAX_DETAIL_CHARS: usize = 1500;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{transport} returned status {status}: {body}")]
    Status {
        transport: &'static str,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTransition {
    Failing,
    Recovered,
}

impl AlertTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failing => "failing",
            Self::Recovered => "recovered",
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            Self::Failing => "🚨",
            Self::Recovered => "✅",
        }
    }
}

impl fmt::Display for AlertTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub tester: String,
    pub transition: AlertTransition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub detail: String,
    pub cycle_at: DateTime<Utc>,
}

impl Alert {
    pub fn subject(&self) -> String {
        match self.transition {
            AlertTransition::Failing => match &self.phase {
                Some(phase) => format!("{} failing in {phase}", self.tester),
                None => format!("{} failing", self.tester),
            },
            AlertTransition::Recovered => format!("{} recovered", self.tester),
        }
    }

    pub fn message(&self) -> String {
        let detail: String = self.detail.chars().take(MAX_DETAIL_CHARS).collect();
        let kind_line = self
            .error_kind
            .map(|kind| format!("Kind: {kind}\n"))
            .unwrap_or_default();
        format!(
            "{emoji} {subject}\nCycle: {cycle}\n{kind_line}{detail}",
            emoji = self.transition.emoji(),
            subject = self.subject(),
            cycle = self.cycle_at.to_rfc3339(),
        )
    }

    /// Groups trigger and resolve events of one tester on the pager.
    pub fn dedup_key(&self) -> String {
        format!("streamtest-{}", self.tester)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail")]
pub enum DispatchStatus {
    Executed { detail: Option<String> },
    Skipped { reason: String },
    Failed { reason: String },
}

impl DispatchStatus {
    fn failed(reason: impl Into<String>) -> Self {
        DispatchStatus::Failed {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchAction {
    pub transport: String,
    pub status: DispatchStatus,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn transport(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<DispatchStatus, AlertError>;
}

async fn check_response(
    transport: &'static str,
    response: reqwest::Response,
) -> Result<DispatchStatus, AlertError> {
    let status = response.status();
    if status.is_success() {
        return Ok(DispatchStatus::Executed {
            detail: Some(status.as_u16().to_string()),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(AlertError::Status {
        transport,
        status: status.as_u16(),
        body: body.chars().take(256).collect(),
    })
}

/// Chat transport posting to a Discord webhook.
#[derive(Clone)]
pub struct DiscordNotifier {
    client: Client,
    config: DiscordSection,
}

impl fmt::Debug for DiscordNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordNotifier")
            .field("user_name", &self.config.user_name)
            .field("users_to_notify", &self.config.users_to_notify)
            .finish()
    }
}

impl DiscordNotifier {
    pub fn new(client: Client, config: DiscordSection) -> Self {
        Self { client, config }
    }

    fn content(&self, alert: &Alert) -> String {
        let mentions = if alert.transition == AlertTransition::Failing {
            self.config
                .users_to_notify
                .iter()
                .map(|user| format!("<@{user}> "))
                .collect::<String>()
        } else {
            String::new()
        };
        format!("{mentions}{}", alert.message())
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn transport(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<DispatchStatus, AlertError> {
        let mut body = json!({ "content": self.content(alert) });
        if let Some(user_name) = &self.config.user_name {
            body["username"] = json!(user_name);
        }
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&body)
            .send()
            .await?;
        check_response("discord", response).await
    }
}

/// Paging transport using PagerDuty Events v2.
#[derive(Clone)]
pub struct PagerDutyNotifier {
    client: Client,
    config: PagerDutySection,
    events_url: String,
}

impl fmt::Debug for PagerDutyNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagerDutyNotifier")
            .field("component", &self.config.component)
            .field("low_urgency", &self.config.low_urgency)
            .field("events_url", &self.events_url)
            .finish()
    }
}

impl PagerDutyNotifier {
    pub fn new(client: Client, config: PagerDutySection) -> Self {
        Self {
            client,
            config,
            events_url: PAGERDUTY_EVENTS_URL.to_string(),
        }
    }

    pub fn with_events_url(mut self, url: impl Into<String>) -> Self {
        self.events_url = url.into();
        self
    }

    /// Low urgency pages as `warning`, otherwise `critical`.
    pub fn severity(&self) -> &'static str {
        if self.config.low_urgency {
            "warning"
        } else {
            "critical"
        }
    }

    pub fn event(&self, alert: &Alert) -> serde_json::Value {
        match alert.transition {
            AlertTransition::Failing => json!({
                "routing_key": self.config.integration_key,
                "event_action": "trigger",
                "dedup_key": alert.dedup_key(),
                "payload": {
                    "summary": alert.subject(),
                    "source": alert.tester,
                    "severity": self.severity(),
                    "component": self.config.component.as_deref().unwrap_or(alert.tester.as_str()),
                    "timestamp": alert.cycle_at.to_rfc3339(),
                    "custom_details": {
                        "phase": alert.phase,
                        "error_kind": alert.error_kind,
                        "detail": alert.detail,
                    },
                },
            }),
            AlertTransition::Recovered => json!({
                "routing_key": self.config.integration_key,
                "event_action": "resolve",
                "dedup_key": alert.dedup_key(),
            }),
        }
    }
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    fn transport(&self) -> &str {
        "pagerduty"
    }

    async fn send(&self, alert: &Alert) -> Result<DispatchStatus, AlertError> {
        let response = self
            .client
            .post(&self.events_url)
            .json(&self.event(alert))
            .send()
            .await?;
        check_response("pagerduty", response).await
    }
}

/// Writes alerts to the log; always registered.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn transport(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<DispatchStatus, AlertError> {
        match alert.transition {
            AlertTransition::Failing => error!(
                tester = %alert.tester,
                phase = alert.phase.as_deref().unwrap_or("-"),
                detail = %alert.detail,
                "tester failing"
            ),
            AlertTransition::Recovered => info!(tester = %alert.tester, "tester recovered"),
        }
        Ok(DispatchStatus::Executed { detail: None })
    }
}

pub fn notifiers_from_config(client: &Client, alerts: &AlertsSection) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(discord) = &alerts.discord {
        notifiers.push(Arc::new(DiscordNotifier::new(client.clone(), discord.clone())));
    }
    if let Some(pagerduty) = &alerts.pagerduty {
        notifiers.push(Arc::new(PagerDutyNotifier::new(
            client.clone(),
            pagerduty.clone(),
        )));
    }
    notifiers
}

/// Sends one alert to every notifier concurrently, each bounded by
/// `send_timeout`. Delivery problems are logged and reported, never raised.
#[derive(Clone)]
pub struct AlertDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    send_timeout: Duration,
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transports: Vec<&str> = self.notifiers.iter().map(|n| n.transport()).collect();
        f.debug_struct("AlertDispatcher")
            .field("transports", &transports)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl AlertDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, send_timeout: Duration) -> Self {
        Self {
            notifiers,
            send_timeout,
        }
    }

    pub fn transports(&self) -> Vec<String> {
        self.notifiers
            .iter()
            .map(|notifier| notifier.transport().to_string())
            .collect()
    }

    pub async fn dispatch(&self, alert: &Alert) -> Vec<DispatchAction> {
        let sends = self.notifiers.iter().map(|notifier| async move {
            let transport = notifier.transport().to_string();
            let status = match timeout(self.send_timeout, notifier.send(alert)).await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => DispatchStatus::failed(err.to_string()),
                Err(_) => DispatchStatus::failed(format!(
                    "timed out after {}s",
                    self.send_timeout.as_secs()
                )),
            };
            if let DispatchStatus::Failed { reason } = &status {
                warn!(transport = %transport, transition = %alert.transition, reason = %reason, "alert delivery failed");
            }
            DispatchAction { transport, status }
        });
        join_all(sends).await
    }
}
