//! Pub/sub transport for meter readings over NATS
//!
//! One subject per meter, `<prefix>.<meter_id>`. The node subscribes to
//! `<prefix>.*` and runs each message through the ingestion gateway in
//! arrival order. Only ledger confirmation leaves the subscription loop.

use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::gateway::{IngestOutcome, IngestionGateway};
use crate::models::MeterReading;

/// Transport section of the node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect to NATS at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Subject prefix; readings arrive on `<prefix>.<meter_id>`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_true() -> bool { true }
fn default_nats_url() -> String { "nats://127.0.0.1:4222".to_string() }
fn default_subject_prefix() -> String { "energy.meters".to_string() }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nats_url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("NATS connection failed: {0}")]
    Connect(String),

    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid reading payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("meter id cannot be used as a subject token: {0:?}")]
    InvalidMeterId(String),
}

/// Subject carrying the readings of one meter
pub fn meter_subject(prefix: &str, meter_id: &str) -> Result<String, TransportError> {
    let invalid = meter_id.is_empty()
        || meter_id
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace());
    if invalid {
        return Err(TransportError::InvalidMeterId(meter_id.to_string()));
    }
    Ok(format!("{}.{}", prefix, meter_id))
}

/// Subscription subject matching every meter
pub fn wildcard_subject(prefix: &str) -> String {
    format!("{}.*", prefix)
}

pub fn meter_id_from_subject<'a>(prefix: &str, subject: &'a str) -> Option<&'a str> {
    subject
        .strip_prefix(prefix)?
        .strip_prefix('.')
        .filter(|id| !id.is_empty() && !id.contains('.'))
}

pub fn decode_reading(payload: &[u8]) -> Result<MeterReading, TransportError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_reading(reading: &MeterReading) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(serde_json::to_vec(reading)?))
}

/// Decode one message and ingest it up to `Stored` before returning.
///
/// `None` when the payload is undecodable or ingestion failed; both are logged.
pub async fn handle_message(
    gateway: &IngestionGateway,
    prefix: &str,
    subject: &str,
    payload: &[u8],
) -> Option<IngestOutcome> {
    let reading = match decode_reading(payload) {
        Ok(reading) => reading,
        Err(e) => {
            warn!(subject = %subject, error = %e, "Discarding undecodable reading");
            return None;
        }
    };

    if let Some(topic_meter) = meter_id_from_subject(prefix, subject) {
        if topic_meter != reading.meter_id {
            debug!(
                subject = %subject,
                meter_id = %reading.meter_id,
                "Subject and payload meter ids differ, using payload"
            );
        }
    }

    match gateway.ingest(reading).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(stage = %e.stage(), error = %e, "Reading processing aborted");
            None
        }
    }
}

#[derive(Clone)]
pub struct MeterTransport {
    client: Client,
    prefix: String,
}

impl MeterTransport {
    pub async fn connect(config: &TransportConfig, name: &str) -> Result<Self, TransportError> {
        info!("Connecting to NATS at {}", config.nats_url);

        // Fail fast when NATS is down; reconnects still happen after the first connect
        let client = ConnectOptions::new()
            .name(name)
            .connection_timeout(Duration::from_secs(5))
            .connect(&config.nats_url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!("Connected to NATS at {}", config.nats_url);

        Ok(Self {
            client,
            prefix: config.subject_prefix.clone(),
        })
    }

    pub async fn publish(&self, reading: &MeterReading) -> Result<(), TransportError> {
        let subject = meter_subject(&self.prefix, &reading.meter_id)?;
        let payload = encode_reading(reading)?;
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    pub async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    /// Subscribe to every meter and feed readings into the gateway until the
    /// subscription closes
    pub async fn run(&self, gateway: Arc<IngestionGateway>) -> Result<(), TransportError> {
        let subject = wildcard_subject(&self.prefix);
        let mut subscription = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;

        info!(subject = %subject, "Subscribed to meter readings");

        while let Some(message) = subscription.next().await {
            handle_message(&gateway, &self.prefix, message.subject.as_str(), &message.payload).await;
        }

        warn!(subject = %subject, "Meter subscription closed");
        Ok(())
    }
}
