//! Outbound notification: mail transports, the primary→fallback chain,
//! and the batch dispatcher for unsent alerts and unnotified hotspots.
//!
//! Delivery failures divide into two kinds and the distinction drives the
//! whole module: *recoverable* failures (bad credentials, connection
//! trouble) are the primary transport's problem and justify retrying the
//! same message on the fallback transport; *terminal* failures (a
//! malformed recipient) would fail identically everywhere, so the chain
//! fails fast without touching the fallback.
//!
//! The dispatcher paces consecutive sends with a fixed delay regardless of
//! outcome, so a failing batch hits the relay no harder than a healthy one.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{MetricStore, StoreError};
use crate::types::{AgentLogEntry, Alert, Component, Hotspot};

// ============================================================================
// Messages & errors
// ============================================================================

/// A rendered outbound message, transport-agnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Proof of delivery from whichever transport accepted the message.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    /// Name of the transport that accepted the message.
    pub transport: String,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport rejected our credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Could not reach the transport at all.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Recipient address the transport will never accept.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Message payload the transport will never accept.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Primary and fallback both failed.
    #[error("primary failed ({primary}); fallback failed ({fallback})")]
    BothFailed { primary: String, fallback: String },
}

impl DeliveryError {
    /// Recoverable errors are specific to one transport and justify the
    /// fallback; everything else would fail the same way anywhere.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeliveryError::Auth(_) | DeliveryError::Connection(_))
    }
}

// ============================================================================
// Transports
// ============================================================================

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError>;
}

/// HTTP mail relay, the production primary.
pub struct HttpRelayTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

#[derive(serde::Deserialize)]
struct RelayResponse {
    id: String,
}

impl HttpRelayTransport {
    pub fn new(base_url: &str, api_key: Option<String>, from: &str) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeliveryError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpRelayTransport {
    fn name(&self) -> &str {
        "http-relay"
    }

    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        let url = format!("{}/messages", self.base_url);
        let mut req = self.http.post(&url).json(&RelayPayload {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            text: &message.body,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                DeliveryError::Connection(e.to_string())
            } else {
                DeliveryError::Connection(format!("relay request failed: {e}"))
            }
        })?;

        match resp.status() {
            s if s.is_success() => {
                let body: RelayResponse = resp
                    .json()
                    .await
                    .map_err(|e| DeliveryError::Connection(e.to_string()))?;
                Ok(DeliveryReceipt {
                    message_id: body.id,
                    transport: "http-relay".into(),
                })
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(DeliveryError::Auth(format!(
                    "relay rejected credentials ({})",
                    resp.status()
                )))
            }
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
                Err(DeliveryError::MalformedPayload(format!(
                    "relay rejected payload ({})",
                    resp.status()
                )))
            }
            status => Err(DeliveryError::Connection(format!(
                "relay returned {status}"
            ))),
        }
    }
}

/// Writes each message as a JSON file into a drop directory. Serves as the
/// development transport and the fallback when the relay is unreachable.
pub struct JsonFileTransport {
    drop_dir: PathBuf,
}

impl JsonFileTransport {
    pub fn new(drop_dir: impl Into<PathBuf>) -> Self {
        Self {
            drop_dir: drop_dir.into(),
        }
    }
}

#[async_trait]
impl MailTransport for JsonFileTransport {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        // The only validation any transport would agree on: an address
        // without '@' is undeliverable everywhere.
        if !message.to.contains('@') {
            return Err(DeliveryError::InvalidRecipient(message.to.clone()));
        }

        tokio::fs::create_dir_all(&self.drop_dir)
            .await
            .map_err(|e| DeliveryError::Connection(e.to_string()))?;

        let filename = format!("msg-{}.json", Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let path = self.drop_dir.join(&filename);
        let payload = serde_json::to_vec_pretty(message)
            .map_err(|e| DeliveryError::MalformedPayload(e.to_string()))?;
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| DeliveryError::Connection(e.to_string()))?;

        Ok(DeliveryReceipt {
            message_id: filename,
            transport: "json-file".into(),
        })
    }
}

// ============================================================================
// Fallback chain
// ============================================================================

/// Primary transport with a fallback for recoverable failures.
pub struct Mailer {
    primary: Box<dyn MailTransport>,
    fallback: Option<Box<dyn MailTransport>>,
}

impl Mailer {
    pub fn new(primary: Box<dyn MailTransport>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn MailTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Send through the primary; on a recoverable failure, retry once on
    /// the fallback. Terminal failures never reach the fallback.
    pub async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        let primary_err = match self.primary.send(message).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) => e,
        };

        if !primary_err.is_recoverable() {
            return Err(primary_err);
        }

        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };

        warn!(
            transport = self.primary.name(),
            error = %primary_err,
            "primary transport failed, retrying on fallback"
        );
        match fallback.send(message).await {
            Ok(receipt) => Ok(receipt),
            Err(fallback_err) => Err(DeliveryError::BothFailed {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub success_count: usize,
    pub failure_count: usize,
}

/// Batch dispatcher for pending alerts and hotspots.
pub struct NotificationDispatcher {
    store: MetricStore,
    mailer: Mailer,
    batch_limit: usize,
    inter_send_delay: Duration,
    operator_email: String,
}

impl NotificationDispatcher {
    pub fn new(
        store: MetricStore,
        mailer: Mailer,
        batch_limit: usize,
        inter_send_delay: Duration,
        operator_email: &str,
    ) -> Self {
        Self {
            store,
            mailer,
            batch_limit,
            inter_send_delay,
            operator_email: operator_email.to_string(),
        }
    }

    /// Dispatch up to `batch_limit` unsent alerts, newest first.
    ///
    /// `sent_at` flips only after a confirmed delivery; a failed alert
    /// stays unsent and is retried on the next run. The inter-send delay
    /// applies after every attempt, success or failure.
    pub async fn dispatch_pending(&self) -> Result<DispatchSummary, StoreError> {
        let pending = self.store.unsent_alerts(self.batch_limit)?;
        if pending.is_empty() {
            return Ok(DispatchSummary::default());
        }
        info!(pending = pending.len(), "dispatching unsent alerts");

        let mut summary = DispatchSummary::default();
        for alert in &pending {
            let recipient = self.alert_recipient(alert)?;
            let message = render_alert(alert, &recipient);

            match self.mailer.send(&message).await {
                Ok(receipt) => {
                    self.store.mark_alert_sent(&alert.id, Utc::now())?;
                    info!(
                        alert = %alert.id,
                        transport = %receipt.transport,
                        to = %recipient,
                        "alert delivered"
                    );
                    summary.success_count += 1;
                }
                Err(e) => {
                    warn!(alert = %alert.id, error = %e, "alert delivery failed, will retry next run");
                    summary.failure_count += 1;
                }
            }

            tokio::time::sleep(self.inter_send_delay).await;
        }

        let entry = if summary.failure_count == 0 {
            AgentLogEntry::success(Component::Notify, Utc::now())
        } else {
            AgentLogEntry::error(
                Component::Notify,
                format!("{} deliveries failed", summary.failure_count),
                Utc::now(),
            )
        };
        self.store.append_log(&entry);

        info!(
            sent = summary.success_count,
            failed = summary.failure_count,
            "alert dispatch complete"
        );
        Ok(summary)
    }

    /// Notify district contacts about unnotified hotspots.
    ///
    /// Unlike alerts (which fall back to the operator address), a hotspot
    /// for a district without a contact is skipped outright and stays
    /// unnotified until a contact is configured.
    pub async fn notify_hotspots(&self) -> Result<DispatchSummary, StoreError> {
        let pending = self.store.unnotified_hotspots(self.batch_limit)?;
        if pending.is_empty() {
            return Ok(DispatchSummary::default());
        }

        let mut summary = DispatchSummary::default();
        for hotspot in &pending {
            let Some(contact) = self
                .store
                .region(&hotspot.district_code)?
                .and_then(|r| r.contact_email)
            else {
                warn!(
                    district = %hotspot.district_code,
                    "no contact for district, hotspot notification skipped"
                );
                continue;
            };

            let message = render_hotspot(hotspot, &contact);
            match self.mailer.send(&message).await {
                Ok(receipt) => {
                    self.store.mark_hotspot_notified(&hotspot.id)?;
                    info!(
                        hotspot = %hotspot.id,
                        transport = %receipt.transport,
                        "hotspot notification delivered"
                    );
                    summary.success_count += 1;
                }
                Err(e) => {
                    warn!(hotspot = %hotspot.id, error = %e, "hotspot notification failed");
                    summary.failure_count += 1;
                }
            }

            tokio::time::sleep(self.inter_send_delay).await;
        }
        Ok(summary)
    }

    /// Region contact address, or the operator address when the region has
    /// no contact on file (or no longer exists).
    fn alert_recipient(&self, alert: &Alert) -> Result<String, StoreError> {
        Ok(self
            .store
            .region(&alert.code)?
            .and_then(|r| r.contact_email)
            .unwrap_or_else(|| self.operator_email.clone()))
    }
}

fn render_alert(alert: &Alert, to: &str) -> Message {
    let body = format!(
        "{}\n\n\
         Region: {} ({})\n\
         Severity: {}/10\n\
         Detected: {}\n\n\
         Suggested mitigation:\n\
         - Verify fixture schedules and shielding in the affected area\n\
         - Cross-check against planned events or construction activity\n\
         - Escalate to the district energy office if radiance persists\n",
        alert.message,
        alert.code,
        alert.level,
        alert.severity,
        alert.detected_at.format("%Y-%m-%d %H:%M UTC"),
    );
    Message {
        to: to.to_string(),
        subject: format!(
            "[skyglow] {} anomaly in {} (severity {}/10)",
            alert.level, alert.code, alert.severity
        ),
        body,
    }
}

fn render_hotspot(hotspot: &Hotspot, to: &str) -> Message {
    let body = format!(
        "A {} night-light hotspot was detected in {}.\n\n\
         Location: {:.4}, {:.4}\n\
         Brightness: {:.2} nW/cm²/sr (change +{:.2})\n\
         Detected: {}\n",
        hotspot.severity,
        hotspot.district_code,
        hotspot.lat,
        hotspot.lng,
        hotspot.brightness,
        hotspot.delta,
        hotspot.detected_at.format("%Y-%m-%d %H:%M UTC"),
    );
    Message {
        to: to.to_string(),
        subject: format!(
            "[skyglow] {} hotspot in {}",
            hotspot.severity, hotspot.district_code
        ),
        body,
    }
}
