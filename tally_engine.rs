//! # Tally Engine - Real-Time Event Aggregation
//!
//! Ingests a continuous stream of analytics events (email sends, opens, clicks
//! and bounces, campaign lifecycle, user sessions, system events) from a
//! message broker, groups them into size- and time-bounded batches per key,
//! maintains multi-resolution counters, flags rate anomalies and republishes
//! the results for dashboards and alerting.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              TALLY ENGINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  broker ─► INGESTION LOOP ─┬─► BATCH LANES ─► AGGREGATOR ─► SINK / PUB   │
//! │   (one per partition)      ├─► COUNTER STORE (atomic pipelines)          │
//! │                            └─► ANOMALY DETECTOR ─────────────► PUB       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - A batch flushes at `batch_size` events or `batch_window_ms` after its
//!   first event, whichever comes first.
//! - Offsets are committed only after an event has been batched, counted and
//!   checked (at-least-once).
//! - Graceful shutdown flushes every open batch before broker connections
//!   are closed.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader, Lines};
use tokio::signal;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::{DashMap, DashSet};
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Identity, Config, CLI, Metrics
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry as PrometheusRegistry, TextEncoder};
use uuid::Uuid;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "tally-engine";
pub const ENGINE_FULL_NAME: &str = "Tally Event Aggregation Engine";

// ----------------------------------------------------------------------------
// Batching
// ----------------------------------------------------------------------------

/// Events per batch before a size-triggered flush
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Time after the first event of a batch before a timer-triggered flush
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 5000;

/// Commands buffered per batch lane before ingestion feels backpressure
pub const DEFAULT_LANE_CAPACITY: usize = 10_000;

/// How long ingestion waits on a full lane before dropping the event
pub const DEFAULT_ENQUEUE_GRACE_MS: u64 = 1000;

/// Upper bound on batch lanes (0 in config = one per CPU)
pub const MAX_LANES: usize = 256;

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

/// Prefix of every counter key written to the store
pub const DEFAULT_KEY_PREFIX: &str = "analytics";

/// Hourly buckets live 24h past their last write
pub const HOURLY_COUNTER_TTL_SECS: u64 = 24 * 3600;

/// Minute buckets live 1h past their last write
pub const MINUTE_COUNTER_TTL_SECS: u64 = 3600;

/// Per-call timeout for counter store round-trips
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 1000;

// ----------------------------------------------------------------------------
// Anomaly Detection
// ----------------------------------------------------------------------------

/// Rate above `baseline * multiplier` is a spike
pub const DEFAULT_SPIKE_MULTIPLIER: f64 = 3.0;

/// Rate below `baseline * multiplier` is a drop
pub const DEFAULT_DROP_MULTIPLIER: f64 = 0.3;

/// Completed minutes folded into a baseline before it may alert
pub const DEFAULT_MIN_BASELINE_SAMPLES: u64 = 3;

/// Exponential moving average alpha (smoothing factor)
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Minimum gap between two alerts for the same event type
pub const DEFAULT_ANOMALY_COOLDOWN_SECS: u64 = 300;

/// Below this many seconds into a minute the previous minute is the estimate
pub const DEFAULT_EARLY_MINUTE_SECS: u32 = 10;

/// Unchecked minutes replayed into a baseline after a gap; older ones are skipped
pub const MAX_BASELINE_CATCHUP_MINUTES: i64 = 10;

// ----------------------------------------------------------------------------
// Sink, Publisher & Broker
// ----------------------------------------------------------------------------

pub const DEFAULT_SINK_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_DURABLE_GRACE_MS: u64 = 30_000;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;
pub const DEFAULT_INPUT_TOPIC: &str = "analytics.events";
pub const DEFAULT_AGGREGATE_TOPIC: &str = "analytics.aggregates";
pub const DEFAULT_ANOMALY_TOPIC: &str = "analytics.anomalies";
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 100;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

// ----------------------------------------------------------------------------
// Lifecycle & Health
// ----------------------------------------------------------------------------

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// Window over which error rates are judged for health
pub const HEALTH_WINDOW_SECS: u64 = 60;

pub const DEFAULT_STORE_ERROR_THRESHOLD: u64 = 10;
pub const DEFAULT_BROKER_ERROR_THRESHOLD: u64 = 5;

/// Flushes slower than this are logged as warnings
pub const SLOW_FLUSH_THRESHOLD_MS: u64 = 250;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The records flowing through the engine. Events are immutable once decoded;
// aggregate records and alerts are created once and handed downstream.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Event Types & Categories
// ----------------------------------------------------------------------------

/// Broad family of an event type. Drives batch keys and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Email,
    Campaign,
    User,
    System,
    Other,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Email => "email",
            EventCategory::Campaign => "campaign",
            EventCategory::User => "user",
            EventCategory::System => "system",
            EventCategory::Other => "other",
        }
    }
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of an analytics event as it appears on the wire (`EMAIL_OPENED`, ...).
///
/// Unrecognized names decode into [`EventType::Other`] and take the
/// pass-through aggregation path instead of failing the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    EmailSent,
    EmailDelivered,
    EmailOpened,
    EmailClicked,
    EmailBounced,
    EmailSpam,
    EmailUnsubscribed,
    CampaignCreated,
    CampaignScheduled,
    CampaignSent,
    CampaignCompleted,
    UserLogin,
    UserLogout,
    UserSignup,
    SessionStarted,
    SessionEnded,
    SystemError,
    SystemWarning,
    SystemInfo,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::EmailSent => "EMAIL_SENT",
            EventType::EmailDelivered => "EMAIL_DELIVERED",
            EventType::EmailOpened => "EMAIL_OPENED",
            EventType::EmailClicked => "EMAIL_CLICKED",
            EventType::EmailBounced => "EMAIL_BOUNCED",
            EventType::EmailSpam => "EMAIL_SPAM",
            EventType::EmailUnsubscribed => "EMAIL_UNSUBSCRIBED",
            EventType::CampaignCreated => "CAMPAIGN_CREATED",
            EventType::CampaignScheduled => "CAMPAIGN_SCHEDULED",
            EventType::CampaignSent => "CAMPAIGN_SENT",
            EventType::CampaignCompleted => "CAMPAIGN_COMPLETED",
            EventType::UserLogin => "USER_LOGIN",
            EventType::UserLogout => "USER_LOGOUT",
            EventType::UserSignup => "USER_SIGNUP",
            EventType::SessionStarted => "SESSION_STARTED",
            EventType::SessionEnded => "SESSION_ENDED",
            EventType::SystemError => "SYSTEM_ERROR",
            EventType::SystemWarning => "SYSTEM_WARNING",
            EventType::SystemInfo => "SYSTEM_INFO",
            EventType::Other(name) => name,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventType::EmailSent
            | EventType::EmailDelivered
            | EventType::EmailOpened
            | EventType::EmailClicked
            | EventType::EmailBounced
            | EventType::EmailSpam
            | EventType::EmailUnsubscribed => EventCategory::Email,
            EventType::CampaignCreated
            | EventType::CampaignScheduled
            | EventType::CampaignSent
            | EventType::CampaignCompleted => EventCategory::Campaign,
            EventType::UserLogin
            | EventType::UserLogout
            | EventType::UserSignup
            | EventType::SessionStarted
            | EventType::SessionEnded => EventCategory::User,
            EventType::SystemError | EventType::SystemWarning | EventType::SystemInfo => {
                EventCategory::System
            }
            EventType::Other(_) => EventCategory::Other,
        }
    }

    /// Whether the anomaly detector looks at this type at all.
    /// User/session traffic and informational system events are low signal.
    pub fn is_anomaly_eligible(&self) -> bool {
        !matches!(self.category(), EventCategory::User) && *self != EventType::SystemInfo
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "EMAIL_SENT" => EventType::EmailSent,
            "EMAIL_DELIVERED" => EventType::EmailDelivered,
            "EMAIL_OPENED" => EventType::EmailOpened,
            "EMAIL_CLICKED" => EventType::EmailClicked,
            "EMAIL_BOUNCED" => EventType::EmailBounced,
            "EMAIL_SPAM" => EventType::EmailSpam,
            "EMAIL_UNSUBSCRIBED" => EventType::EmailUnsubscribed,
            "CAMPAIGN_CREATED" => EventType::CampaignCreated,
            "CAMPAIGN_SCHEDULED" => EventType::CampaignScheduled,
            "CAMPAIGN_SENT" => EventType::CampaignSent,
            "CAMPAIGN_COMPLETED" => EventType::CampaignCompleted,
            "USER_LOGIN" => EventType::UserLogin,
            "USER_LOGOUT" => EventType::UserLogout,
            "USER_SIGNUP" => EventType::UserSignup,
            "SESSION_STARTED" => EventType::SessionStarted,
            "SESSION_ENDED" => EventType::SessionEnded,
            "SYSTEM_ERROR" => EventType::SystemError,
            "SYSTEM_WARNING" => EventType::SystemWarning,
            "SYSTEM_INFO" => EventType::SystemInfo,
            _ => EventType::Other(name),
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::from(name.to_string())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventType::from(s))
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Event Metadata
// ----------------------------------------------------------------------------

/// Schema-free metadata carried by an event, with typed accessors for the
/// fields the aggregator branches on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(JsonMap<String, JsonValue>);

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A non-empty string or a number rendered as a string.
    fn label(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn campaign_id(&self) -> Option<String> {
        self.label("campaignId")
    }

    pub fn link(&self) -> Option<String> {
        self.label("link")
    }

    pub fn reason(&self) -> Option<String> {
        self.label("reason")
    }

    pub fn user_agent(&self) -> Option<String> {
        self.label("userAgent")
    }

    pub fn error_code(&self) -> Option<String> {
        self.label("errorCode")
    }

    pub fn service(&self) -> Option<String> {
        self.label("service")
    }

    /// Recipients of a campaign send. Missing, negative or unparsable values count as 0.
    pub fn recipient_count(&self) -> u64 {
        match self.0.get("recipientCount") {
            Some(JsonValue::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|v| *v > 0.0).map(|v| v as u64))
                .unwrap_or(0),
            Some(JsonValue::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
            _ => 0,
        }
    }
}

impl From<JsonMap<String, JsonValue>> for EventMetadata {
    fn from(map: JsonMap<String, JsonValue>) -> Self {
        Self(map)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Analytics Event
// ----------------------------------------------------------------------------

/// A decoded analytics event. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Payload id, or `{topic}-{partition}-{offset}` when the producer sent none.
    /// Stable across redelivery so sinks can deduplicate.
    pub id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(id: impl Into<String>, event_type: impl Into<EventType>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            entity_id: None,
            user_id: None,
            metadata: EventMetadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata = self.metadata.with(key, value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey::for_event(self)
    }
}

// ----------------------------------------------------------------------------
// 3.4 Batch Key
// ----------------------------------------------------------------------------

/// Grouping key for aggregation. Every event sharing a key lands in the same
/// batch lane and is aggregated in the same flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// - email events: `email:{campaignId}` (`unknown` when absent)
    /// - campaign events: `campaign:{entityId}`
    /// - user, system and unrecognized events: `{category}:{EVENT_TYPE}`
    pub fn for_event(event: &AnalyticsEvent) -> Self {
        let category = event.event_type.category();
        let scope = match category {
            EventCategory::Email => event
                .metadata
                .campaign_id()
                .unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            EventCategory::Campaign => event
                .entity_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            EventCategory::User | EventCategory::System | EventCategory::Other => {
                event.event_type.as_str().to_string()
            }
        };
        Self(format!("{}:{}", category.as_str(), scope))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group label for events missing the field they are grouped by.
pub const UNKNOWN_GROUP: &str = "unknown";

// ----------------------------------------------------------------------------
// 3.5 Flush Trigger
// ----------------------------------------------------------------------------

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl Display for FlushTrigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.6 Aggregate Records
// ----------------------------------------------------------------------------

/// Result of aggregating one event type within one flushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    /// Deterministic id (same batch in, same id out) for idempotent sinks
    pub id: Uuid,
    pub batch_key: BatchKey,
    pub event_type: EventType,
    pub count: u64,
    pub data: AggregateData,
    pub timestamp: DateTime<Utc>,
}

/// Type-specific derived fields of an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AggregateData {
    /// Email events grouped by `campaignId`
    Email {
        campaigns: BTreeMap<String, EmailGroupStats>,
    },
    /// Campaign events grouped by `userId`
    #[serde(rename_all = "camelCase")]
    Campaign {
        users: BTreeMap<String, CampaignGroupStats>,
        total_recipients: u64,
    },
    /// Login/logout/session traffic
    #[serde(rename_all = "camelCase")]
    User {
        distinct_users: u64,
        user_agents: BTreeMap<String, u64>,
    },
    /// System events grouped by `service`
    System {
        services: BTreeMap<String, SystemGroupStats>,
    },
    /// Unrecognized event types, passed through untouched
    Raw { events: Vec<AnalyticsEvent> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailGroupStats {
    pub count: u64,
    pub distinct_entities: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub link_clicks: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bounce_reasons: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignGroupStats {
    pub count: u64,
    pub recipient_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemGroupStats {
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_codes: BTreeMap<String, u64>,
}

// ----------------------------------------------------------------------------
// 3.7 Anomaly Alerts
// ----------------------------------------------------------------------------

/// Whether the observed rate was above or below the baseline band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyDirection {
    Spike,
    Drop,
}

/// Emitted when a per-type rate leaves the baseline band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyAlert {
    pub id: Uuid,
    pub event_type: EventType,
    /// Events per minute
    pub current_rate: f64,
    /// Baseline events per minute
    pub expected_rate: f64,
    /// `current_rate / expected_rate`
    pub deviation: f64,
    pub direction: AnomalyDirection,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyAlert {
    pub fn new(
        event_type: EventType,
        current_rate: f64,
        expected_rate: f64,
        direction: AnomalyDirection,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let deviation = if expected_rate > 0.0 { current_rate / expected_rate } else { 0.0 };
        let message = format!(
            "{} rate {:.1}/min is {:.2}x the baseline of {:.1}/min ({})",
            event_type,
            current_rate,
            deviation,
            expected_rate,
            match direction {
                AnomalyDirection::Spike => "spike",
                AnomalyDirection::Drop => "drop",
            }
        );
        Self {
            id: Uuid::new_v4(),
            event_type,
            current_rate,
            expected_rate,
            deviation,
            direction,
            message,
            timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.8 Inbound Broker Message
// ----------------------------------------------------------------------------

/// A raw message pulled from one broker partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
        }
    }

    /// `topic/partition@offset`, used in logs and decode errors
    pub fn position(&self) -> String {
        format!("{}/{}@{}", self.topic, self.partition, self.offset)
    }

    /// Event id used when the payload carries none.
    pub fn fallback_event_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}


// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type per failure domain, all convertible into `TallyError`.
// Errors local to one event or one batch never cross into other keys or
// partitions; the types here carry enough context to log and move on.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Tally engine.
#[derive(Error, Debug)]
pub enum TallyError {
    // ---- Ingestion ----
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    // ---- Batching & Flush ----
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    // ---- Downstream ----
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    // ---- Configuration ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl TallyError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            TallyError::Decode(_) => true,
            TallyError::Broker(e) => e.is_recoverable(),
            TallyError::Batch(_) => true,
            TallyError::Flush(_) => true,
            TallyError::Store(_) => true,
            TallyError::Sink(e) => e.is_recoverable(),
            TallyError::Config(_) => false,
            TallyError::Io(_) => true,
            TallyError::Internal(_) => false,
            TallyError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            TallyError::Decode(_) => "decode",
            TallyError::Broker(_) => "broker",
            TallyError::Batch(_) => "batch",
            TallyError::Flush(_) => "flush",
            TallyError::Store(_) => "store",
            TallyError::Sink(_) => "sink",
            TallyError::Config(_) => "config",
            TallyError::Io(_) => "io",
            TallyError::Internal(_) => "internal",
            TallyError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            TallyError::Decode(_) => RecoveryHint::Skip,
            TallyError::Broker(e) => e.recovery_hint(),
            TallyError::Batch(BatchError::Backpressure { .. }) => RecoveryHint::Skip,
            TallyError::Flush(_) => RecoveryHint::Skip,
            TallyError::Store(_) => RecoveryHint::Skip,
            TallyError::Sink(e) => e.recovery_hint(),
            TallyError::Config(_) => RecoveryHint::FixConfiguration,
            TallyError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry once, right away
    RetryOnce,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the broker or store
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// 4.2 Decode Errors
// ----------------------------------------------------------------------------

/// A message that could not be turned into an [`AnalyticsEvent`].
/// Always dropped, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload at {position}: {message}")]
    Malformed { position: String, message: String },

    #[error("Missing eventType at {position}")]
    MissingEventType { position: String },

    #[error("Invalid timestamp '{value}' at {position}: {message}")]
    InvalidTimestamp {
        position: String,
        value: String,
        message: String,
    },
}

impl DecodeError {
    pub fn position(&self) -> &str {
        match self {
            DecodeError::Malformed { position, .. }
            | DecodeError::MissingEventType { position }
            | DecodeError::InvalidTimestamp { position, .. } => position,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Flush Errors
// ----------------------------------------------------------------------------

/// Failure while turning one batch into outputs. Logged, batch discarded.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("Cannot aggregate an empty batch for key '{key}'")]
    EmptyBatch { key: String },

    #[error("Failed to persist {what} for key '{key}': {source}")]
    Persist {
        key: String,
        what: &'static str,
        #[source]
        source: SinkError,
    },

    #[error("Failed to publish aggregate for key '{key}': {source}")]
    Publish {
        key: String,
        #[source]
        source: SinkError,
    },
}

// ----------------------------------------------------------------------------
// 4.4 Counter Store Errors
// ----------------------------------------------------------------------------

/// Counter store unavailable or misbehaving. Increments are skipped.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Counter store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Counter store command failed: {message}")]
    Command { message: String },

    #[error("Counter store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable {
                message: err.to_string(),
            }
        } else {
            StoreError::Command {
                message: err.to_string(),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Broker Errors
// ----------------------------------------------------------------------------

/// Broker connection problems. Ingestion pauses and reconnects with backoff.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection lost on {source_name}: {message}")]
    ConnectionLost { source_name: String, message: String },

    #[error("Failed to commit offset {offset} on {source_name}: {message}")]
    Commit {
        source_name: String,
        offset: u64,
        message: String,
    },

    #[error("Event source {source_name} is closed")]
    Closed { source_name: String },
}

impl BrokerError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BrokerError::Closed { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            BrokerError::ConnectionLost { .. } => RecoveryHint::Reconnect,
            BrokerError::Commit { .. } => RecoveryHint::RetryWithBackoff,
            BrokerError::Closed { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Sink & Publisher Errors
// ----------------------------------------------------------------------------

/// Errors from the persistence sink and the result publisher
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Write failed on {target}: {message}")]
    Write { target: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output {target} is closed")]
    Closed { target: String },
}

impl SinkError {
    pub fn write(target: impl Into<String>, message: impl Into<String>) -> Self {
        SinkError::Write {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SinkError::Serialization(_) | SinkError::Closed { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SinkError::Timeout { .. } | SinkError::Write { .. } | SinkError::Io(_) => {
                RecoveryHint::RetryOnce
            }
            SinkError::Serialization(_) => RecoveryHint::Skip,
            SinkError::Closed { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Batch Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch lane {lane} stayed full for {waited_ms}ms")]
    Backpressure { lane: usize, waited_ms: u64 },

    #[error("Batch accumulator is closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// 4.8 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.9 Result Type Aliases
// ----------------------------------------------------------------------------

pub type TallyResult<T> = Result<T, TallyError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type SinkResult<T> = Result<T, SinkError>;
pub type BrokerResult<T> = Result<T, BrokerError>;

// ----------------------------------------------------------------------------
// 4.10 Windowed Rate
// ----------------------------------------------------------------------------

/// Counts events in a sliding window of fixed-width buckets.
#[derive(Debug)]
pub struct WindowedRate {
    origin: Instant,
    bucket_width: Duration,
    buckets: Mutex<Vec<(u64, u64)>>,
}

impl WindowedRate {
    pub fn new(window: Duration, num_buckets: usize) -> Self {
        let num_buckets = num_buckets.max(2);
        let bucket_width = (window / num_buckets as u32).max(Duration::from_millis(1));
        Self {
            origin: Instant::now(),
            bucket_width,
            buckets: Mutex::new(vec![(u64::MAX, 0); num_buckets]),
        }
    }

    fn epoch(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    pub fn record(&self) {
        let epoch = self.epoch();
        let mut buckets = self.buckets.lock();
        let len = buckets.len() as u64;
        let slot = &mut buckets[(epoch % len) as usize];
        if slot.0 != epoch {
            *slot = (epoch, 0);
        }
        slot.1 += 1;
    }

    /// Events recorded within the window ending now.
    pub fn total_in_window(&self) -> u64 {
        let epoch = self.epoch();
        let buckets = self.buckets.lock();
        let len = buckets.len() as u64;
        buckets
            .iter()
            .filter(|(bucket_epoch, _)| *bucket_epoch != u64::MAX && epoch.saturating_sub(*bucket_epoch) < len)
            .map(|(_, count)| *count)
            .sum()
    }
}

// ----------------------------------------------------------------------------
// 4.11 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring and health reporting
#[derive(Debug)]
pub struct ErrorStats {
    /// Total errors by category
    by_category: DashMap<&'static str, AtomicU64>,
    /// Recent errors by category
    recent: DashMap<&'static str, WindowedRate>,
    window: Duration,
    recoverable_count: AtomicU64,
    non_recoverable_count: AtomicU64,
}

impl Default for ErrorStats {
    fn default() -> Self {
        Self::new(Duration::from_secs(HEALTH_WINDOW_SECS))
    }
}

impl ErrorStats {
    pub fn new(window: Duration) -> Self {
        Self {
            by_category: DashMap::new(),
            recent: DashMap::new(),
            window,
            recoverable_count: AtomicU64::new(0),
            non_recoverable_count: AtomicU64::new(0),
        }
    }

    /// Record an error
    pub fn record(&self, error: &TallyError) {
        let category = error.category();
        self.by_category
            .entry(category)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.recent
            .entry(category)
            .or_insert_with(|| WindowedRate::new(self.window, 12))
            .record();

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    /// Errors of `category` within the health window
    pub fn recent(&self, category: &str) -> u64 {
        self.recent
            .get(category)
            .map(|rate| rate.total_in_window())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let decode: TallyError = DecodeError::MissingEventType {
            position: "t/0@1".into(),
        }
        .into();
        assert_eq!(decode.category(), "decode");
        assert_eq!(decode.recovery_hint(), RecoveryHint::Skip);

        let broker: TallyError = BrokerError::ConnectionLost {
            source_name: "t/0".into(),
            message: "reset".into(),
        }
        .into();
        assert!(broker.is_recoverable());
        assert_eq!(broker.recovery_hint(), RecoveryHint::Reconnect);

        let config: TallyError = ConfigError::invalid_value("batching.batch_size", "zero").into();
        assert!(!config.is_recoverable());
        assert_eq!(config.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_error_stats_by_category() {
        let stats = ErrorStats::default();
        let store: TallyError = StoreError::Timeout { timeout_ms: 5 }.into();
        stats.record(&store);
        stats.record(&store);
        stats.record(&TallyError::ShuttingDown);

        assert_eq!(stats.total_errors(), 3);
        assert_eq!(stats.count_by_category("store"), 2);
        assert_eq!(stats.recent("store"), 2);
        assert_eq!(stats.recent("broker"), 0);
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - compiled-in defaults
// - optional TOML file
// - TALLY_-prefixed environment variables (`__` separates sections)
// - the bare BATCH_SIZE / BATCH_WINDOW_MS / ANOMALY_DETECTION_ENABLED /
//   DURABILITY_MODE variables deployments already set
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the Tally engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub anomaly_detection: AnomalyDetectionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub outputs: OutputsConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bare environment variables recognized without the `TALLY_` prefix.
const PLAIN_ENV_KEYS: [&str; 4] = [
    "BATCH_SIZE",
    "BATCH_WINDOW_MS",
    "ANOMALY_DETECTION_ENABLED",
    "DURABILITY_MODE",
];

impl EngineConfig {
    /// Layered figment for an optional config file.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("TALLY_").split("__"))
            .merge(Env::raw().only(&PLAIN_ENV_KEYS).map(|key| {
                match key.as_str().to_ascii_lowercase().as_str() {
                    "batch_size" => "batching.batch_size",
                    "batch_window_ms" => "batching.batch_window_ms",
                    "anomaly_detection_enabled" => "anomaly_detection.enabled",
                    _ => "sink.durability",
                }
                .into()
            }))
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Self::figment(Some(path)))
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Self::figment(None))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batching.batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "batching.batch_size",
                "Batch size must be at least 1",
            ));
        }
        if self.batching.batch_window_ms == 0 {
            return Err(ConfigError::invalid_value(
                "batching.batch_window_ms",
                "Batch window must be at least 1ms",
            ));
        }
        if self.batching.lane_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "batching.lane_capacity",
                "Lane capacity must be at least 1",
            ));
        }
        if self.batching.lanes > MAX_LANES {
            return Err(ConfigError::invalid_value(
                "batching.lanes",
                format!("Lane count cannot exceed {}", MAX_LANES),
            ));
        }

        let anomaly = &self.anomaly_detection;
        if anomaly.spike_multiplier <= 0.0 || anomaly.drop_multiplier <= 0.0 {
            return Err(ConfigError::invalid_value(
                "anomaly_detection",
                "Spike and drop multipliers must be positive",
            ));
        }
        if anomaly.drop_multiplier >= anomaly.spike_multiplier {
            return Err(ConfigError::invalid_value(
                "anomaly_detection.drop_multiplier",
                "Drop multiplier must be below the spike multiplier",
            ));
        }
        if !(anomaly.ema_alpha > 0.0 && anomaly.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid_value(
                "anomaly_detection.ema_alpha",
                "EMA alpha must be in (0, 1]",
            ));
        }
        if anomaly.early_minute_secs >= 60 {
            return Err(ConfigError::invalid_value(
                "anomaly_detection.early_minute_secs",
                "Must be below 60",
            ));
        }

        if self.sink.timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "sink.timeout_ms",
                "Sink timeout must be at least 1ms",
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "store.timeout_ms",
                "Store timeout must be at least 1ms",
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(ConfigError::invalid_value("store.key_prefix", "Must not be empty"));
        }
        if self.outputs.broadcast_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "outputs.broadcast_capacity",
                "Must be at least 1",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Lane count, auto-detected from available parallelism when 0
    pub fn effective_lanes(&self) -> usize {
        if self.batching.lanes == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, MAX_LANES)
        } else {
            self.batching.lanes
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_instance_name() -> String {
    ENGINE_NAME.to_string()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Batching Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Flush when a batch reaches this many events
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush this long after a batch's first event
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Number of batch lanes (0 = auto-detect)
    #[serde(default)]
    pub lanes: usize,

    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    #[serde(default = "default_enqueue_grace_ms")]
    pub enqueue_grace_ms: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_window_ms() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}

fn default_lane_capacity() -> usize {
    DEFAULT_LANE_CAPACITY
}

fn default_enqueue_grace_ms() -> u64 {
    DEFAULT_ENQUEUE_GRACE_MS
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            lanes: 0,
            lane_capacity: default_lane_capacity(),
            enqueue_grace_ms: default_enqueue_grace_ms(),
        }
    }
}

impl BatchingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

// ----------------------------------------------------------------------------
// 5.4 Anomaly Detection Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_spike_multiplier")]
    pub spike_multiplier: f64,

    #[serde(default = "default_drop_multiplier")]
    pub drop_multiplier: f64,

    /// Completed minutes required before a baseline may alert
    #[serde(default = "default_min_baseline_samples")]
    pub min_baseline_samples: u64,

    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// At most one alert per event type within this many seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default = "default_early_minute_secs")]
    pub early_minute_secs: u32,
}

fn default_true() -> bool {
    true
}

fn default_spike_multiplier() -> f64 {
    DEFAULT_SPIKE_MULTIPLIER
}

fn default_drop_multiplier() -> f64 {
    DEFAULT_DROP_MULTIPLIER
}

fn default_min_baseline_samples() -> u64 {
    DEFAULT_MIN_BASELINE_SAMPLES
}

fn default_ema_alpha() -> f64 {
    DEFAULT_EMA_ALPHA
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_ANOMALY_COOLDOWN_SECS
}

fn default_early_minute_secs() -> u32 {
    DEFAULT_EARLY_MINUTE_SECS
}

impl Default for AnomalyDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spike_multiplier: default_spike_multiplier(),
            drop_multiplier: default_drop_multiplier(),
            min_baseline_samples: default_min_baseline_samples(),
            ema_alpha: default_ema_alpha(),
            cooldown_secs: default_cooldown_secs(),
            early_minute_secs: default_early_minute_secs(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.5 Counter Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; the in-process store is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Sink Configuration
// ----------------------------------------------------------------------------

/// When the ingestion loop may commit an offset relative to persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Persist on flush, log failures, never hold back commits
    #[default]
    #[serde(alias = "best_effort")]
    BestEffort,
    /// Persist each raw event before its offset is committed
    Durable,
}

impl Display for Durability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Durability::BestEffort => write!(f, "best-effort"),
            Durability::Durable => write!(f, "durable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub durability: Durability,

    /// Directory for `events.jsonl` / `aggregates.jsonl`; in-memory sink when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Bound on every persist/publish call
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,

    /// How long durable mode keeps retrying one event before dropping it
    #[serde(default = "default_durable_grace_ms")]
    pub durable_grace_ms: u64,
}

fn default_sink_timeout_ms() -> u64 {
    DEFAULT_SINK_TIMEOUT_MS
}

fn default_durable_grace_ms() -> u64 {
    DEFAULT_DURABLE_GRACE_MS
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            durability: Durability::BestEffort,
            directory: None,
            timeout_ms: default_sink_timeout_ms(),
            durable_grace_ms: default_durable_grace_ms(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.7 Output Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputsConfig {
    #[serde(default = "default_aggregate_topic")]
    pub aggregate_topic: String,

    #[serde(default = "default_anomaly_topic")]
    pub anomaly_topic: String,

    /// Print published records to stdout as NDJSON
    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_aggregate_topic() -> String {
    DEFAULT_AGGREGATE_TOPIC.to_string()
}

fn default_anomaly_topic() -> String {
    DEFAULT_ANOMALY_TOPIC.to_string()
}

fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            aggregate_topic: default_aggregate_topic(),
            anomaly_topic: default_anomaly_topic(),
            stdout: true,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.8 Broker Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic name stamped on messages read from files or stdin
    #[serde(default = "default_input_topic")]
    pub topic: String,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_input_topic() -> String {
    DEFAULT_INPUT_TOPIC.to_string()
}

fn default_reconnect_base_ms() -> u64 {
    DEFAULT_RECONNECT_BASE_MS
}

fn default_reconnect_max_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_MS
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_input_topic(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.9 Health Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_window_secs")]
    pub window_secs: u64,

    /// Store errors within the window that mark the engine degraded
    #[serde(default = "default_store_error_threshold")]
    pub store_error_threshold: u64,

    #[serde(default = "default_broker_error_threshold")]
    pub broker_error_threshold: u64,
}

fn default_health_window_secs() -> u64 {
    HEALTH_WINDOW_SECS
}

fn default_store_error_threshold() -> u64 {
    DEFAULT_STORE_ERROR_THRESHOLD
}

fn default_broker_error_threshold() -> u64 {
    DEFAULT_BROKER_ERROR_THRESHOLD
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_health_window_secs(),
            store_error_threshold: default_store_error_threshold(),
            broker_error_threshold: default_broker_error_threshold(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.10 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, compact, pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log records
    #[serde(default)]
    pub source_location: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batching.batch_size, 100);
        assert_eq!(config.batching.batch_window_ms, 5000);
        assert!(config.anomaly_detection.enabled);
        assert_eq!(config.sink.durability, Durability::BestEffort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let config = EngineConfig::from_str(
            r#"
            [batching]
            batch_size = 10

            [sink]
            durability = "durable"
            "#,
        )
        .unwrap();
        assert_eq!(config.batching.batch_size, 10);
        assert_eq!(config.batching.batch_window_ms, DEFAULT_BATCH_WINDOW_MS);
        assert_eq!(config.sink.durability, Durability::Durable);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.batching.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "batching.batch_size"
        ));

        let mut config = EngineConfig::default();
        config.anomaly_detection.drop_multiplier = 4.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.anomaly_detection.ema_alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sink.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tally.toml",
                r#"
                [batching]
                batch_size = 50
                batch_window_ms = 2000
                "#,
            )?;
            jail.set_env("BATCH_SIZE", "25");
            jail.set_env("ANOMALY_DETECTION_ENABLED", "false");
            jail.set_env("DURABILITY_MODE", "durable");
            jail.set_env("TALLY_STORE__KEY_PREFIX", "stats");

            let config = EngineConfig::load("tally.toml").expect("config loads");
            assert_eq!(config.batching.batch_size, 25);
            assert_eq!(config.batching.batch_window_ms, 2000);
            assert!(!config.anomaly_detection.enabled);
            assert_eq!(config.sink.durability, Durability::Durable);
            assert_eq!(config.store.key_prefix, "stats");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with per-component targets (`tally::ingest`,
// `tally::batch`, `tally::flush`, ...) so operators can filter with RUST_LOG.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> TallyResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_timer(tracing_fmt::time::ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.map_err(|e| TallyError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "tally::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Logging Macros for Engine Components
// ----------------------------------------------------------------------------

/// Log a completed batch flush
#[macro_export]
macro_rules! log_flush {
    ($key:expr, $trigger:expr, $events:expr) => {
        tracing::debug!(
            target: "tally::flush",
            batch_key = %$key,
            trigger = %$trigger,
            events = $events,
            "Batch flushed"
        )
    };
    ($key:expr, $trigger:expr, $events:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "tally::flush",
            batch_key = %$key,
            trigger = %$trigger,
            events = $events,
            $($field)*,
            "Batch flushed"
        )
    };
}

/// Log an emitted anomaly alert
#[macro_export]
macro_rules! log_anomaly {
    ($alert:expr) => {
        tracing::warn!(
            target: "tally::anomaly",
            event_type = %$alert.event_type,
            current_rate = $alert.current_rate,
            expected_rate = $alert.expected_rate,
            deviation = $alert.deviation,
            "Anomaly detected"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// A simple timer for measuring operation duration
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "tally::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "tally::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: METRICS
// ============================================================================

/// Prometheus counters for the engine, in a private registry.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<PrometheusRegistry>,
    events_ingested: IntCounter,
    events_dropped: IntCounterVec,
    decode_errors: IntCounter,
    flushes: IntCounterVec,
    aggregates_emitted: IntCounter,
    store_errors: IntCounter,
    anomalies: IntCounterVec,
    sink_failures: IntCounterVec,
    open_batches: IntGauge,
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("ingested", &self.ingested())
            .field("open_batches", &self.open_batches())
            .finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(PrometheusRegistry::new());

        let events_ingested = IntCounter::new(
            "tally_events_ingested_total",
            "Events decoded and routed by the ingestion loops",
        )?;
        registry.register(Box::new(events_ingested.clone()))?;

        let events_dropped = IntCounterVec::new(
            Opts::new("tally_events_dropped_total", "Events dropped before aggregation"),
            &["reason"],
        )?;
        registry.register(Box::new(events_dropped.clone()))?;

        let decode_errors = IntCounter::new(
            "tally_decode_errors_total",
            "Inbound messages that failed to decode",
        )?;
        registry.register(Box::new(decode_errors.clone()))?;

        let flushes = IntCounterVec::new(
            Opts::new("tally_flushes_total", "Batch flushes by trigger"),
            &["trigger"],
        )?;
        registry.register(Box::new(flushes.clone()))?;

        let aggregates_emitted = IntCounter::new(
            "tally_aggregates_emitted_total",
            "Aggregate records produced by flushes",
        )?;
        registry.register(Box::new(aggregates_emitted.clone()))?;

        let store_errors = IntCounter::new(
            "tally_store_errors_total",
            "Counter store pipelines that failed",
        )?;
        registry.register(Box::new(store_errors.clone()))?;

        let anomalies = IntCounterVec::new(
            Opts::new("tally_anomalies_total", "Anomaly alerts emitted"),
            &["event_type"],
        )?;
        registry.register(Box::new(anomalies.clone()))?;

        let sink_failures = IntCounterVec::new(
            Opts::new("tally_sink_failures_total", "Failed persist and publish calls"),
            &["operation"],
        )?;
        registry.register(Box::new(sink_failures.clone()))?;

        let open_batches = IntGauge::new("tally_open_batches", "Batches currently accumulating")?;
        registry.register(Box::new(open_batches.clone()))?;

        Ok(Self {
            registry,
            events_ingested,
            events_dropped,
            decode_errors,
            flushes,
            aggregates_emitted,
            store_errors,
            anomalies,
            sink_failures,
            open_batches,
        })
    }

    pub fn record_ingested(&self) {
        self.events_ingested.inc();
    }

    pub fn record_dropped(&self, reason: &str) {
        self.events_dropped.with_label_values(&[reason]).inc();
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.inc();
    }

    pub fn record_flush(&self, trigger: FlushTrigger) {
        self.flushes.with_label_values(&[trigger.as_str()]).inc();
    }

    pub fn record_aggregate(&self) {
        self.aggregates_emitted.inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors.inc();
    }

    pub fn record_anomaly(&self, event_type: &EventType) {
        self.anomalies.with_label_values(&[event_type.as_str()]).inc();
    }

    pub fn record_sink_failure(&self, operation: &str) {
        self.sink_failures.with_label_values(&[operation]).inc();
    }

    pub fn batch_opened(&self) {
        self.open_batches.inc();
    }

    pub fn batch_closed(&self) {
        self.open_batches.dec();
    }

    pub fn ingested(&self) -> u64 {
        self.events_ingested.get()
    }

    pub fn dropped(&self, reason: &str) -> u64 {
        self.events_dropped.with_label_values(&[reason]).get()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.get()
    }

    pub fn flushes(&self, trigger: FlushTrigger) -> u64 {
        self.flushes.with_label_values(&[trigger.as_str()]).get()
    }

    pub fn aggregates_emitted(&self) -> u64 {
        self.aggregates_emitted.get()
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.get()
    }

    pub fn anomalies(&self, event_type: &EventType) -> u64 {
        self.anomalies.with_label_values(&[event_type.as_str()]).get()
    }

    pub fn sink_failures(&self, operation: &str) -> u64 {
        self.sink_failures.with_label_values(&[operation]).get()
    }

    pub fn open_batches(&self) -> i64 {
        self.open_batches.get()
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(target: "tally::engine", error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_ingested();
        metrics.record_flush(FlushTrigger::Size);
        metrics.record_dropped("backpressure");

        assert_eq!(metrics.ingested(), 1);
        assert_eq!(metrics.flushes(FlushTrigger::Size), 1);
        assert_eq!(metrics.dropped("backpressure"), 1);

        let text = metrics.render();
        assert!(text.contains("tally_events_ingested_total 1"));
        assert!(text.contains("tally_flushes_total{trigger=\"size\"} 1"));
    }
}

// ============================================================================
// SECTION 8: COUNTER STORE LAYER
// ============================================================================
// Multi-resolution counters (total, hourly, minute) per event type, optionally
// narrowed to an entity or user. Every increment for one event goes out as a
// single atomic pipeline; nothing here ever reads a counter and writes it back.
//
// Key layout:
//   {prefix}:{EVENT_TYPE}:total
//   {prefix}:{EVENT_TYPE}:hourly:{YYYYMMDDHH}
//   {prefix}:{EVENT_TYPE}:minute:{YYYYMMDDHHMM}
//   {prefix}:entity:{entityId}:{EVENT_TYPE}:...
//   {prefix}:user:{userId}:{EVENT_TYPE}:...
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Resolutions & Scopes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Total,
    Hourly,
    Minute,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Total, Resolution::Hourly, Resolution::Minute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Total => "total",
            Resolution::Hourly => "hourly",
            Resolution::Minute => "minute",
        }
    }

    /// Time bucket suffix, `None` for the total counter
    pub fn bucket(&self, at: DateTime<Utc>) -> Option<String> {
        match self {
            Resolution::Total => None,
            Resolution::Hourly => Some(at.format("%Y%m%d%H").to_string()),
            Resolution::Minute => Some(at.format("%Y%m%d%H%M").to_string()),
        }
    }

    /// Expiry (re)applied on every write; total counters never expire
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Resolution::Total => None,
            Resolution::Hourly => Some(Duration::from_secs(HOURLY_COUNTER_TTL_SECS)),
            Resolution::Minute => Some(Duration::from_secs(MINUTE_COUNTER_TTL_SECS)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterScope {
    Global,
    Entity(String),
    User(String),
}

impl CounterScope {
    /// Scopes an event contributes to: always global, plus entity and user when present.
    pub fn for_event(event: &AnalyticsEvent) -> Vec<CounterScope> {
        let mut scopes = Vec::with_capacity(3);
        scopes.push(CounterScope::Global);
        if let Some(entity_id) = &event.entity_id {
            scopes.push(CounterScope::Entity(entity_id.clone()));
        }
        if let Some(user_id) = &event.user_id {
            scopes.push(CounterScope::User(user_id.clone()));
        }
        scopes
    }
}

// ----------------------------------------------------------------------------
// 8.2 Store Operations & Trait
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOp {
    Incr { key: String, by: i64 },
    Expire { key: String, ttl: Duration },
}

/// Key-value store with atomic increment, expiry and transactional pipelines.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Run every op or none. Returns the post-increment value of each `Incr`, in order.
    async fn execute_atomic(&self, ops: &[CounterOp]) -> StoreResult<Vec<i64>>;

    /// Current value; missing or expired keys read as 0.
    async fn get(&self, key: &str) -> StoreResult<i64>;

    fn backend(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// 8.3 In-Process Store
// ----------------------------------------------------------------------------

/// In-process counter store. One lock covers a whole pipeline, expiry is lazy.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<AHashMap<String, MemoryCounter>>,
}

#[derive(Debug, Clone, Copy)]
struct MemoryCounter {
    value: i64,
    expires_at: Option<tokio::time::Instant>,
}

impl MemoryCounter {
    fn is_live(&self, now: tokio::time::Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = tokio::time::Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, counter| counter.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn execute_atomic(&self, ops: &[CounterOp]) -> StoreResult<Vec<i64>> {
        let now = tokio::time::Instant::now();
        let mut entries = self.entries.lock();
        let mut results = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                CounterOp::Incr { key, by } => {
                    let counter = entries.entry(key.clone()).or_insert(MemoryCounter {
                        value: 0,
                        expires_at: None,
                    });
                    if !counter.is_live(now) {
                        *counter = MemoryCounter {
                            value: 0,
                            expires_at: None,
                        };
                    }
                    counter.value += by;
                    results.push(counter.value);
                }
                CounterOp::Expire { key, ttl } => {
                    if let Some(counter) = entries.get_mut(key) {
                        counter.expires_at = Some(now + *ttl);
                    }
                }
            }
        }

        Ok(results)
    }

    async fn get(&self, key: &str) -> StoreResult<i64> {
        let now = tokio::time::Instant::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|counter| counter.is_live(now))
            .map(|counter| counter.value)
            .unwrap_or(0))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ----------------------------------------------------------------------------
// 8.4 Redis Store
// ----------------------------------------------------------------------------

/// Redis-backed counters. Pipelines run as MULTI/EXEC.
#[cfg(feature = "redis-store")]
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: redis::aio::ConnectionManager,
    timeout: Duration,
}

#[cfg(feature = "redis-store")]
impl Debug for RedisCounterStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(feature = "redis-store")]
impl RedisCounterStore {
    pub async fn connect(url: &str, timeout_ms: u64) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let timeout_dur = Duration::from_millis(timeout_ms);
        let connection = timeout(timeout_dur, redis::aio::ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout { timeout_ms })??;
        info!(target: "tally::counters", url = %url, "Connected to Redis counter store");
        Ok(Self {
            connection,
            timeout: timeout_dur,
        })
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn execute_atomic(&self, ops: &[CounterOp]) -> StoreResult<Vec<i64>> {
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        for op in ops {
            match op {
                CounterOp::Incr { key, by } => {
                    pipeline.cmd("INCRBY").arg(key).arg(*by);
                }
                CounterOp::Expire { key, ttl } => {
                    pipeline.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        let result: redis::RedisResult<Vec<i64>> = timeout(self.timeout, pipeline.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout {
                timeout_ms: self.timeout_ms(),
            })?;
        Ok(result?)
    }

    async fn get(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<Option<i64>> =
            timeout(self.timeout, redis::cmd("GET").arg(key).query_async(&mut conn))
                .await
                .map_err(|_| StoreError::Timeout {
                    timeout_ms: self.timeout_ms(),
                })?;
        Ok(result?.unwrap_or(0))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

// ----------------------------------------------------------------------------
// 8.5 Event Counters
// ----------------------------------------------------------------------------

/// Counter access layer used by ingestion and the anomaly detector.
#[derive(Debug, Clone)]
pub struct EventCounters {
    store: Arc<dyn CounterStore>,
    prefix: String,
}

impl EventCounters {
    pub fn new(store: Arc<dyn CounterStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn key(
        &self,
        scope: &CounterScope,
        event_type: &EventType,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> String {
        let mut key = match scope {
            CounterScope::Global => format!("{}:{}", self.prefix, event_type),
            CounterScope::Entity(id) => format!("{}:entity:{}:{}", self.prefix, id, event_type),
            CounterScope::User(id) => format!("{}:user:{}:{}", self.prefix, id, event_type),
        };
        key.push(':');
        key.push_str(resolution.as_str());
        if let Some(bucket) = resolution.bucket(at) {
            key.push(':');
            key.push_str(&bucket);
        }
        key
    }

    /// Every command one event contributes, in pipeline order.
    pub fn plan(&self, event: &AnalyticsEvent, at: DateTime<Utc>) -> Vec<CounterOp> {
        let scopes = CounterScope::for_event(event);
        let mut ops = Vec::with_capacity(scopes.len() * 5);
        for scope in &scopes {
            for resolution in Resolution::ALL {
                let key = self.key(scope, &event.event_type, resolution, at);
                ops.push(CounterOp::Incr {
                    key: key.clone(),
                    by: 1,
                });
                if let Some(ttl) = resolution.ttl() {
                    ops.push(CounterOp::Expire { key, ttl });
                }
            }
        }
        ops
    }

    /// Count one event in every scope and resolution at the current time.
    pub async fn increment(&self, event: &AnalyticsEvent) -> StoreResult<()> {
        self.increment_at(event, Utc::now()).await
    }

    pub async fn increment_at(&self, event: &AnalyticsEvent, at: DateTime<Utc>) -> StoreResult<()> {
        let ops = self.plan(event, at);
        let values = self.store.execute_atomic(&ops).await?;
        trace!(
            target: "tally::counters",
            event_type = %event.event_type,
            commands = ops.len(),
            total = values.first().copied().unwrap_or_default(),
            "Counters incremented"
        );
        Ok(())
    }

    /// Global count of `event_type` in the minute containing `minute`.
    pub async fn minute_count(&self, event_type: &EventType, minute: DateTime<Utc>) -> StoreResult<u64> {
        let key = self.key(&CounterScope::Global, event_type, Resolution::Minute, minute);
        Ok(self.store.get(&key).await?.max(0) as u64)
    }

    pub async fn count(
        &self,
        scope: &CounterScope,
        event_type: &EventType,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let key = self.key(scope, event_type, resolution, at);
        Ok(self.store.get(&key).await?.max(0) as u64)
    }
}


// ============================================================================
// SECTION 9: AGGREGATOR
// ============================================================================
// Pure computation: a flushed batch in, one aggregate record per event type
// out. Same input always yields the same record, including its id.
// ============================================================================

/// Split a batch by event type, keeping first-appearance order of the types
/// and arrival order within each group.
pub fn group_by_type(events: Vec<AnalyticsEvent>) -> Vec<(EventType, Vec<AnalyticsEvent>)> {
    let mut groups: Vec<(EventType, Vec<AnalyticsEvent>)> = Vec::new();
    let mut index: AHashMap<EventType, usize> = AHashMap::new();
    for event in events {
        match index.get(&event.event_type) {
            Some(&slot) => groups[slot].1.push(event),
            None => {
                index.insert(event.event_type.clone(), groups.len());
                groups.push((event.event_type.clone(), vec![event]));
            }
        }
    }
    groups
}

/// Aggregate the events of one type within one batch.
pub fn aggregate(
    key: &BatchKey,
    event_type: &EventType,
    events: &[AnalyticsEvent],
    flushed_at: DateTime<Utc>,
) -> Result<AggregateRecord, FlushError> {
    let (first, last) = match (events.first(), events.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(FlushError::EmptyBatch {
                key: key.to_string(),
            })
        }
    };

    let data = match event_type.category() {
        EventCategory::Email => aggregate_email(event_type, events),
        EventCategory::Campaign => aggregate_campaign(event_type, events),
        EventCategory::User => aggregate_user(events),
        EventCategory::System => aggregate_system(event_type, events),
        EventCategory::Other => AggregateData::Raw {
            events: events.to_vec(),
        },
    };

    let identity = format!(
        "{}|{}|{}|{}|{}",
        key,
        event_type,
        first.id,
        last.id,
        events.len()
    );

    Ok(AggregateRecord {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes()),
        batch_key: key.clone(),
        event_type: event_type.clone(),
        count: events.len() as u64,
        data,
        timestamp: flushed_at,
    })
}

fn group_label(value: Option<String>) -> String {
    value.unwrap_or_else(|| UNKNOWN_GROUP.to_string())
}

fn tally(map: &mut BTreeMap<String, u64>, label: String) {
    *map.entry(label).or_insert(0) += 1;
}

fn aggregate_email(event_type: &EventType, events: &[AnalyticsEvent]) -> AggregateData {
    let mut campaigns: BTreeMap<String, EmailGroupStats> = BTreeMap::new();
    let mut entities: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();

    for event in events {
        let campaign = group_label(event.metadata.campaign_id());
        let stats = campaigns.entry(campaign.clone()).or_default();
        stats.count += 1;
        if let Some(entity_id) = event.entity_id.as_deref() {
            entities.entry(campaign).or_default().insert(entity_id);
        }
        match event_type {
            EventType::EmailClicked => tally(&mut stats.link_clicks, group_label(event.metadata.link())),
            EventType::EmailBounced => {
                tally(&mut stats.bounce_reasons, group_label(event.metadata.reason()))
            }
            _ => {}
        }
    }

    for (campaign, stats) in campaigns.iter_mut() {
        stats.distinct_entities = entities.get(campaign).map_or(0, |set| set.len() as u64);
        if *event_type == EventType::EmailOpened {
            stats.open_rate = Some(stats.distinct_entities as f64 / stats.count as f64);
        }
    }

    AggregateData::Email { campaigns }
}

fn aggregate_campaign(event_type: &EventType, events: &[AnalyticsEvent]) -> AggregateData {
    let mut users: BTreeMap<String, CampaignGroupStats> = BTreeMap::new();
    let mut total_recipients = 0u64;

    for event in events {
        let stats = users.entry(group_label(event.user_id.clone())).or_default();
        stats.count += 1;
        if *event_type == EventType::CampaignSent {
            let recipients = event.metadata.recipient_count();
            stats.recipient_count = stats.recipient_count.saturating_add(recipients);
            total_recipients = total_recipients.saturating_add(recipients);
        }
    }

    AggregateData::Campaign {
        users,
        total_recipients,
    }
}

fn aggregate_user(events: &[AnalyticsEvent]) -> AggregateData {
    let mut distinct: BTreeSet<&str> = BTreeSet::new();
    let mut user_agents = BTreeMap::new();

    for event in events {
        if let Some(id) = event.entity_id.as_deref().or(event.user_id.as_deref()) {
            distinct.insert(id);
        }
        tally(&mut user_agents, group_label(event.metadata.user_agent()));
    }

    AggregateData::User {
        distinct_users: distinct.len() as u64,
        user_agents,
    }
}

fn aggregate_system(event_type: &EventType, events: &[AnalyticsEvent]) -> AggregateData {
    let mut services: BTreeMap<String, SystemGroupStats> = BTreeMap::new();

    for event in events {
        let stats = services.entry(group_label(event.metadata.service())).or_default();
        stats.count += 1;
        if *event_type == EventType::SystemError {
            tally(&mut stats.error_codes, group_label(event.metadata.error_code()));
        }
    }

    AggregateData::System { services }
}

#[cfg(test)]
mod aggregator_tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn flushed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 5).unwrap()
    }

    fn opened(i: usize, entity: &str, campaign: Option<&str>) -> AnalyticsEvent {
        let event = AnalyticsEvent::new(format!("o{}", i), EventType::EmailOpened).with_entity(entity);
        match campaign {
            Some(c) => event.with_metadata("campaignId", c),
            None => event,
        }
    }

    #[test]
    fn test_email_open_rate() {
        let events: Vec<_> = (0..10)
            .map(|i| opened(i, &format!("msg-{}", i % 4), Some("C1")))
            .collect();
        let key = BatchKey::new("email:C1");
        let record = aggregate(&key, &EventType::EmailOpened, &events, flushed_at()).unwrap();

        assert_eq!(record.count, 10);
        let AggregateData::Email { campaigns } = &record.data else {
            panic!("expected email aggregate, got {:?}", record.data);
        };
        let c1 = &campaigns["C1"];
        assert_eq!(c1.distinct_entities, 4);
        assert_eq!(c1.open_rate, Some(0.4));
    }

    #[test]
    fn test_missing_campaign_groups_under_unknown() {
        let events = vec![opened(0, "a", None), opened(1, "b", Some("C2")), opened(2, "c", None)];
        let record = aggregate(
            &BatchKey::new("email:mixed"),
            &EventType::EmailOpened,
            &events,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::Email { campaigns } = record.data else {
            panic!("expected email aggregate");
        };
        assert_eq!(campaigns["unknown"].count, 2);
        assert_eq!(campaigns["C2"].count, 1);
    }

    #[test]
    fn test_clicks_and_bounces() {
        let clicks = vec![
            AnalyticsEvent::new("k1", EventType::EmailClicked).with_metadata("link", "https://a"),
            AnalyticsEvent::new("k2", EventType::EmailClicked).with_metadata("link", "https://a"),
            AnalyticsEvent::new("k3", EventType::EmailClicked).with_metadata("link", "https://b"),
        ];
        let record = aggregate(
            &BatchKey::new("email:unknown"),
            &EventType::EmailClicked,
            &clicks,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::Email { campaigns } = record.data else {
            panic!("expected email aggregate");
        };
        let stats = &campaigns["unknown"];
        assert_eq!(stats.link_clicks["https://a"], 2);
        assert_eq!(stats.link_clicks["https://b"], 1);
        assert_eq!(stats.open_rate, None);

        let bounces = vec![
            AnalyticsEvent::new("b1", EventType::EmailBounced).with_metadata("reason", "mailbox_full"),
            AnalyticsEvent::new("b2", EventType::EmailBounced),
        ];
        let record = aggregate(
            &BatchKey::new("email:unknown"),
            &EventType::EmailBounced,
            &bounces,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::Email { campaigns } = record.data else {
            panic!("expected email aggregate");
        };
        assert_eq!(campaigns["unknown"].bounce_reasons["mailbox_full"], 1);
        assert_eq!(campaigns["unknown"].bounce_reasons["unknown"], 1);
    }

    #[test]
    fn test_campaign_recipients() {
        let events = vec![
            AnalyticsEvent::new("c1", EventType::CampaignSent)
                .with_user("owner-1")
                .with_metadata("recipientCount", 120),
            AnalyticsEvent::new("c2", EventType::CampaignSent).with_user("owner-1"),
            AnalyticsEvent::new("c3", EventType::CampaignSent)
                .with_user("owner-2")
                .with_metadata("recipientCount", 30),
        ];
        let record = aggregate(
            &BatchKey::new("campaign:camp-1"),
            &EventType::CampaignSent,
            &events,
            flushed_at(),
        )
        .unwrap();
        assert_eq!(
            record.data,
            AggregateData::Campaign {
                users: BTreeMap::from([
                    (
                        "owner-1".to_string(),
                        CampaignGroupStats {
                            count: 2,
                            recipient_count: 120
                        }
                    ),
                    (
                        "owner-2".to_string(),
                        CampaignGroupStats {
                            count: 1,
                            recipient_count: 30
                        }
                    ),
                ]),
                total_recipients: 150,
            }
        );
    }

    #[test]
    fn test_recipient_totals_saturate() {
        let events = vec![
            AnalyticsEvent::new("c1", EventType::CampaignSent)
                .with_user("owner-1")
                .with_metadata("recipientCount", u64::MAX),
            AnalyticsEvent::new("c2", EventType::CampaignSent)
                .with_user("owner-1")
                .with_metadata("recipientCount", 1e20),
            AnalyticsEvent::new("c3", EventType::CampaignSent)
                .with_user("owner-2")
                .with_metadata("recipientCount", 1),
        ];
        let record = aggregate(
            &BatchKey::new("campaign:huge"),
            &EventType::CampaignSent,
            &events,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::Campaign { users, total_recipients } = record.data else {
            panic!("expected campaign aggregate");
        };
        assert_eq!(users["owner-1"].recipient_count, u64::MAX);
        assert_eq!(users["owner-2"].recipient_count, 1);
        assert_eq!(total_recipients, u64::MAX);
    }

    #[test]
    fn test_user_and_system_branches() {
        let logins = vec![
            AnalyticsEvent::new("l1", EventType::UserLogin)
                .with_entity("u1")
                .with_metadata("userAgent", "firefox"),
            AnalyticsEvent::new("l2", EventType::UserLogin)
                .with_entity("u1")
                .with_metadata("userAgent", "chrome"),
            AnalyticsEvent::new("l3", EventType::UserLogin).with_user("u2"),
        ];
        let record = aggregate(
            &BatchKey::new("user:USER_LOGIN"),
            &EventType::UserLogin,
            &logins,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::User {
            distinct_users,
            user_agents,
        } = record.data
        else {
            panic!("expected user aggregate");
        };
        assert_eq!(distinct_users, 2);
        assert_eq!(user_agents.len(), 3);

        let errors = vec![
            AnalyticsEvent::new("s1", EventType::SystemError)
                .with_metadata("service", "mailer")
                .with_metadata("errorCode", "E42"),
            AnalyticsEvent::new("s2", EventType::SystemError)
                .with_metadata("service", "mailer")
                .with_metadata("errorCode", "E42"),
            AnalyticsEvent::new("s3", EventType::SystemError).with_metadata("service", "api"),
        ];
        let record = aggregate(
            &BatchKey::new("system:SYSTEM_ERROR"),
            &EventType::SystemError,
            &errors,
            flushed_at(),
        )
        .unwrap();
        let AggregateData::System { services } = record.data else {
            panic!("expected system aggregate");
        };
        assert_eq!(services["mailer"].error_codes["E42"], 2);
        assert_eq!(services["api"].error_codes["unknown"], 1);
    }

    #[test]
    fn test_unknown_types_pass_through() {
        let events = vec![AnalyticsEvent::new("w1", "WEBHOOK_RECEIVED").with_metadata("x", 1)];
        let event_type = EventType::from("WEBHOOK_RECEIVED");
        let record = aggregate(&events[0].batch_key(), &event_type, &events, flushed_at()).unwrap();
        assert_eq!(record.data, AggregateData::Raw { events: events.clone() });
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let events: Vec<_> = (0..5).map(|i| opened(i, "m", Some("C1"))).collect();
        let key = BatchKey::new("email:C1");
        let a = aggregate(&key, &EventType::EmailOpened, &events, flushed_at()).unwrap();
        let b = aggregate(&key, &EventType::EmailOpened, &events, flushed_at()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let result = aggregate(&BatchKey::new("email:C1"), &EventType::EmailOpened, &[], flushed_at());
        assert!(matches!(result, Err(FlushError::EmptyBatch { .. })));
    }

    #[test]
    fn test_group_by_type_keeps_order() {
        let events = vec![
            AnalyticsEvent::new("1", EventType::EmailSent),
            AnalyticsEvent::new("2", EventType::EmailOpened),
            AnalyticsEvent::new("3", EventType::EmailSent),
        ];
        let groups = group_by_type(events);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, EventType::EmailSent);
        let ids: Vec<_> = groups[0].1.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}

// ============================================================================
// SECTION 10: ANOMALY DETECTOR
// ============================================================================
// Per-type rate versus an exponential moving average of completed minutes.
// Baselines live in a DashMap; no guard is held across a store round-trip.
// ============================================================================

/// Rolling expected rate for one event type
#[derive(Debug, Clone, Default)]
struct Baseline {
    ema: f64,
    samples: u64,
    /// Minute this baseline last saw, used to detect minute rollover
    tracked_minute: Option<DateTime<Utc>>,
    last_alert: Option<DateTime<Utc>>,
}

impl Baseline {
    /// Fold the completed minutes, oldest first, once the current minute
    /// moves past the tracked one.
    fn advance(&mut self, current_minute: DateTime<Utc>, completed: &[u64], alpha: f64) {
        match self.tracked_minute {
            None => self.tracked_minute = Some(current_minute),
            Some(tracked) if tracked < current_minute => {
                for &count in completed {
                    let value = count as f64;
                    self.ema = if self.samples == 0 {
                        value
                    } else {
                        alpha * value + (1.0 - alpha) * self.ema
                    };
                    self.samples += 1;
                }
                self.tracked_minute = Some(current_minute);
            }
            Some(_) => {}
        }
    }
}

/// Snapshot of one baseline, for stats and tests
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaselineSnapshot {
    pub expected_rate: f64,
    pub samples: u64,
}

/// Events/minute estimate for the current minute.
///
/// Early in a minute with traffic in the previous minute, the previous
/// minute's count stands in for the rate; otherwise the current count is
/// extrapolated to a full minute.
pub fn estimate_rate(current_count: u64, previous_count: u64, seconds_into_minute: f64, early_minute_secs: u32) -> f64 {
    if seconds_into_minute < early_minute_secs as f64 && previous_count > 0 {
        previous_count as f64
    } else {
        current_count as f64 / seconds_into_minute.max(1.0) * 60.0
    }
}

#[derive(Debug)]
pub struct AnomalyDetector {
    counters: EventCounters,
    config: AnomalyDetectionConfig,
    baselines: DashMap<EventType, Baseline>,
}

impl AnomalyDetector {
    pub fn new(counters: EventCounters, config: AnomalyDetectionConfig) -> Self {
        Self {
            counters,
            config,
            baselines: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn check_anomaly(&self, event_type: &EventType) -> StoreResult<Option<AnomalyAlert>> {
        self.check_at(event_type, Utc::now()).await
    }

    /// Check `event_type` as of `now`. Store failures skip the check.
    pub async fn check_at(&self, event_type: &EventType, now: DateTime<Utc>) -> StoreResult<Option<AnomalyAlert>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let current_minute = now
            .duration_trunc(ChronoDuration::minutes(1))
            .unwrap_or(now);
        let previous_minute = current_minute - ChronoDuration::minutes(1);
        let current_count = self.counters.minute_count(event_type, current_minute).await?;
        let previous_count = self.counters.minute_count(event_type, previous_minute).await?;

        let seconds_into_minute = now.second() as f64 + now.nanosecond() as f64 / 1e9;
        let rate = estimate_rate(
            current_count,
            previous_count,
            seconds_into_minute,
            self.config.early_minute_secs,
        );

        let tracked = self.baselines.get(event_type).and_then(|b| b.tracked_minute);
        let completed = match tracked {
            Some(tracked) if tracked < current_minute => {
                self.completed_minutes(event_type, tracked, current_minute, previous_count)
                    .await?
            }
            _ => Vec::new(),
        };

        let mut baseline = self.baselines.entry(event_type.clone()).or_default();
        // Another check may have advanced it while the counters were read
        if baseline.tracked_minute == tracked {
            baseline.advance(current_minute, &completed, self.config.ema_alpha);
        }

        if baseline.samples < self.config.min_baseline_samples || baseline.ema <= 0.0 {
            return Ok(None);
        }

        let expected = baseline.ema;
        let deviation = rate / expected;
        let direction = if deviation > self.config.spike_multiplier {
            AnomalyDirection::Spike
        } else if deviation < self.config.drop_multiplier {
            AnomalyDirection::Drop
        } else {
            return Ok(None);
        };

        let cooldown = ChronoDuration::seconds(self.config.cooldown_secs as i64);
        if let Some(last) = baseline.last_alert {
            if now - last < cooldown {
                debug!(
                    target: "tally::anomaly",
                    event_type = %event_type,
                    deviation,
                    "Anomaly suppressed by cooldown"
                );
                return Ok(None);
            }
        }
        baseline.last_alert = Some(now);
        drop(baseline);

        let alert = AnomalyAlert::new(event_type.clone(), rate, expected, direction, now);
        log_anomaly!(alert);
        Ok(Some(alert))
    }

    /// Counts of every minute from `tracked` up to the one before
    /// `current_minute`, with at most [`MAX_BASELINE_CATCHUP_MINUTES`] of the
    /// minutes in between.
    async fn completed_minutes(
        &self,
        event_type: &EventType,
        tracked: DateTime<Utc>,
        current_minute: DateTime<Utc>,
        previous_count: u64,
    ) -> StoreResult<Vec<u64>> {
        let last = current_minute - ChronoDuration::minutes(1);
        if tracked >= last {
            return Ok(vec![previous_count]);
        }

        let mut counts = vec![self.counters.minute_count(event_type, tracked).await?];
        let between = ((last - tracked).num_minutes() - 1).clamp(0, MAX_BASELINE_CATCHUP_MINUTES);
        for back in (1..=between).rev() {
            let minute = last - ChronoDuration::minutes(back);
            counts.push(self.counters.minute_count(event_type, minute).await?);
        }
        counts.push(previous_count);
        Ok(counts)
    }

    /// Install a baseline directly, as if `samples` minutes averaging
    /// `rate` had already been observed up to `at`.
    pub fn seed_baseline(&self, event_type: EventType, rate: f64, samples: u64, at: DateTime<Utc>) {
        let minute = at.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(at);
        self.baselines.insert(
            event_type,
            Baseline {
                ema: rate,
                samples,
                tracked_minute: Some(minute),
                last_alert: None,
            },
        );
    }

    pub fn baseline(&self, event_type: &EventType) -> Option<BaselineSnapshot> {
        self.baselines.get(event_type).map(|b| BaselineSnapshot {
            expected_rate: b.ema,
            samples: b.samples,
        })
    }

    pub fn tracked_types(&self) -> usize {
        self.baselines.len()
    }
}

#[cfg(test)]
mod anomaly_tests {
    use super::*;
    use chrono::TimeZone;

    fn minute_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
    }

    fn detector() -> (EventCounters, AnomalyDetector) {
        let counters = EventCounters::new(Arc::new(MemoryCounterStore::new()), DEFAULT_KEY_PREFIX);
        let detector = AnomalyDetector::new(counters.clone(), AnomalyDetectionConfig::default());
        (counters, detector)
    }

    async fn record(counters: &EventCounters, event_type: EventType, n: usize, at: DateTime<Utc>) {
        for i in 0..n {
            let event = AnalyticsEvent::new(format!("{}", i), event_type.clone());
            counters.increment_at(&event, at).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spike_emits_exactly_one_alert() {
        let (counters, detector) = detector();
        let bounced = EventType::EmailBounced;
        detector.seed_baseline(bounced.clone(), 10.0, 5, minute_start());

        let now = minute_start() + ChronoDuration::seconds(12);
        record(&counters, bounced.clone(), 7, now).await;

        let alert = detector.check_at(&bounced, now).await.unwrap().expect("spike alert");
        assert_eq!(alert.direction, AnomalyDirection::Spike);
        assert!((alert.current_rate - 35.0).abs() < 1e-9);
        assert!((alert.expected_rate - 10.0).abs() < 1e-9);
        assert!((alert.deviation - 3.5).abs() < 1e-9);

        let again = detector
            .check_at(&bounced, now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_rate_within_band_is_quiet() {
        let (counters, detector) = detector();
        let sent = EventType::EmailSent;
        detector.seed_baseline(sent.clone(), 10.0, 5, minute_start());

        let now = minute_start() + ChronoDuration::seconds(20);
        record(&counters, sent.clone(), 4, now).await;
        assert!(detector.check_at(&sent, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sample_floor_blocks_alerts() {
        let (counters, detector) = detector();
        let bounced = EventType::EmailBounced;
        detector.seed_baseline(bounced.clone(), 10.0, 2, minute_start());

        let now = minute_start() + ChronoDuration::seconds(12);
        record(&counters, bounced.clone(), 20, now).await;
        assert!(detector.check_at(&bounced, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_detection() {
        let (counters, detector) = detector();
        let delivered = EventType::EmailDelivered;
        detector.seed_baseline(delivered.clone(), 100.0, 10, minute_start());

        let now = minute_start() + ChronoDuration::seconds(30);
        record(&counters, delivered.clone(), 5, now).await;
        let alert = detector.check_at(&delivered, now).await.unwrap().expect("drop alert");
        assert_eq!(alert.direction, AnomalyDirection::Drop);
    }

    #[tokio::test]
    async fn test_minute_rollover_folds_previous_count() {
        let (counters, detector) = detector();
        let sent = EventType::EmailSent;
        detector.seed_baseline(sent.clone(), 10.0, 3, minute_start());

        record(&counters, sent.clone(), 20, minute_start() + ChronoDuration::seconds(40)).await;
        let next = minute_start() + ChronoDuration::seconds(75);
        record(&counters, sent.clone(), 1, next).await;
        detector.check_at(&sent, next).await.unwrap();

        let snapshot = detector.baseline(&sent).unwrap();
        assert_eq!(snapshot.samples, 4);
        assert!((snapshot.expected_rate - (0.3 * 20.0 + 0.7 * 10.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_busy_minute_before_gap_is_folded() {
        let (counters, detector) = detector();
        let sent = EventType::EmailSent;
        detector.seed_baseline(sent.clone(), 10.0, 3, minute_start());

        let busy = minute_start() + ChronoDuration::seconds(20);
        record(&counters, sent.clone(), 30, busy).await;
        detector.check_at(&sent, busy).await.unwrap();

        // Nothing during the next minute, then traffic again 30s into the one after
        let later = minute_start() + ChronoDuration::seconds(150);
        record(&counters, sent.clone(), 1, later).await;
        detector.check_at(&sent, later).await.unwrap();

        let snapshot = detector.baseline(&sent).unwrap();
        assert_eq!(snapshot.samples, 5);
        let after_busy = 0.3 * 30.0 + 0.7 * 10.0;
        assert!((snapshot.expected_rate - 0.7 * after_busy).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_long_idle_stretch_is_capped() {
        let (counters, detector) = detector();
        let sent = EventType::EmailSent;
        detector.seed_baseline(sent.clone(), 10.0, 3, minute_start());

        let later = minute_start() + ChronoDuration::minutes(45) + ChronoDuration::seconds(30);
        record(&counters, sent.clone(), 1, later).await;
        detector.check_at(&sent, later).await.unwrap();

        // tracked minute, capped gap, then the minute just before `later`
        let snapshot = detector.baseline(&sent).unwrap();
        assert_eq!(snapshot.samples, 3 + 1 + MAX_BASELINE_CATCHUP_MINUTES as u64 + 1);
    }

    #[test]
    fn test_early_minute_uses_previous_count() {
        assert_eq!(estimate_rate(1, 20, 5.0, 10), 20.0);
        assert_eq!(estimate_rate(3, 0, 4.0, 10), 45.0);
        assert_eq!(estimate_rate(30, 50, 30.0, 10), 60.0);
    }

    #[tokio::test]
    async fn test_disabled_detector_never_alerts() {
        let counters = EventCounters::new(Arc::new(MemoryCounterStore::new()), DEFAULT_KEY_PREFIX);
        let config = AnomalyDetectionConfig {
            enabled: false,
            ..Default::default()
        };
        let detector = AnomalyDetector::new(counters.clone(), config);
        detector.seed_baseline(EventType::EmailBounced, 1.0, 10, minute_start());
        let now = minute_start() + ChronoDuration::seconds(30);
        record(&counters, EventType::EmailBounced, 50, now).await;
        assert!(detector.check_at(&EventType::EmailBounced, now).await.unwrap().is_none());
    }
}

// ============================================================================
// SECTION 11: PERSISTENCE SINKS & RESULT PUBLISHERS
// ============================================================================
// Downstream boundary. Every call reports failure through its result and is
// bounded by `sink.timeout_ms` with one retry; a slow sink costs a flush a
// bounded amount of time and never stalls ingestion indefinitely.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Traits
// ----------------------------------------------------------------------------

/// Durable storage for raw events and aggregate records.
/// Writes are idempotent on the event id / record id.
#[async_trait]
pub trait PersistenceSink: Send + Sync + Debug {
    /// Returns how many events were newly written.
    async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize>;

    /// Returns false when the record was already stored.
    async fn persist_aggregate(&self, record: &AggregateRecord) -> SinkResult<bool>;

    fn name(&self) -> &'static str;
}

/// Outbound channels for aggregates and alerts.
#[async_trait]
pub trait ResultPublisher: Send + Sync + Debug {
    async fn publish_aggregate(&self, record: &AggregateRecord) -> SinkResult<()>;

    async fn publish_anomaly(&self, alert: &AnomalyAlert) -> SinkResult<()>;

    /// Push out anything buffered. Called once during shutdown.
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// 11.2 In-Memory Sink
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AnalyticsEvent>>,
    aggregates: Mutex<Vec<AggregateRecord>>,
    event_ids: DashSet<String>,
    aggregate_ids: DashSet<Uuid>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn aggregates(&self) -> Vec<AggregateRecord> {
        self.aggregates.lock().clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize> {
        let mut stored = self.events.lock();
        let before = stored.len();
        for event in events {
            if self.event_ids.insert(event.id.clone()) {
                stored.push(event.clone());
            }
        }
        Ok(stored.len() - before)
    }

    async fn persist_aggregate(&self, record: &AggregateRecord) -> SinkResult<bool> {
        if !self.aggregate_ids.insert(record.id) {
            return Ok(false);
        }
        self.aggregates.lock().push(record.clone());
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ----------------------------------------------------------------------------
// 11.3 JSONL File Sink
// ----------------------------------------------------------------------------

type JsonlWriter = tokio::sync::Mutex<tokio::fs::File>;

/// Append-only `events.jsonl` and `aggregates.jsonl` in one directory.
/// Deduplicates by id for the lifetime of the process.
#[derive(Debug)]
pub struct JsonlSink {
    directory: PathBuf,
    events: JsonlWriter,
    aggregates: JsonlWriter,
    event_ids: DashSet<String>,
    aggregate_ids: DashSet<Uuid>,
}

impl JsonlSink {
    pub const EVENTS_FILE: &'static str = "events.jsonl";
    pub const AGGREGATES_FILE: &'static str = "aggregates.jsonl";

    pub async fn open(directory: impl AsRef<Path>) -> SinkResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        let events = Self::open_append(&directory.join(Self::EVENTS_FILE)).await?;
        let aggregates = Self::open_append(&directory.join(Self::AGGREGATES_FILE)).await?;
        info!(target: "tally::sink", directory = %directory.display(), "JSONL sink opened");
        Ok(Self {
            directory,
            events: tokio::sync::Mutex::new(events),
            aggregates: tokio::sync::Mutex::new(aggregates),
            event_ids: DashSet::new(),
            aggregate_ids: DashSet::new(),
        })
    }

    async fn open_append(path: &Path) -> SinkResult<tokio::fs::File> {
        Ok(tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// One write per call; the caller holds the file lock.
    async fn append(writer: &mut tokio::fs::File, lines: &str) -> SinkResult<()> {
        writer.write_all(lines.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize> {
        let mut writer = self.events.lock().await;
        let mut pending = Vec::with_capacity(events.len());
        for event in events.iter().filter(|event| !self.event_ids.contains(&event.id)) {
            pending.push((event.id.as_str(), serde_json::to_string(event)?));
        }

        // Ids are claimed before the write starts. A call cancelled by its
        // timeout keeps them, so the retry does not append the lines twice.
        let mut lines = String::new();
        let mut claimed = Vec::new();
        for (id, line) in pending {
            if self.event_ids.insert(id.to_string()) {
                lines.push_str(&line);
                lines.push('\n');
                claimed.push(id);
            }
        }
        if claimed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = Self::append(&mut writer, &lines).await {
            for id in &claimed {
                self.event_ids.remove(*id);
            }
            return Err(e);
        }
        Ok(claimed.len())
    }

    async fn persist_aggregate(&self, record: &AggregateRecord) -> SinkResult<bool> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut writer = self.aggregates.lock().await;
        if !self.aggregate_ids.insert(record.id) {
            return Ok(false);
        }
        if let Err(e) = Self::append(&mut writer, &line).await {
            self.aggregate_ids.remove(&record.id);
            return Err(e);
        }
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

// ----------------------------------------------------------------------------
// 11.4 Broadcast Publisher
// ----------------------------------------------------------------------------

/// In-process fan-out over tokio broadcast channels, one per output topic.
#[derive(Debug)]
pub struct BroadcastPublisher {
    aggregates: broadcast::Sender<Arc<AggregateRecord>>,
    anomalies: broadcast::Sender<Arc<AnomalyAlert>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (aggregates, _) = broadcast::channel(capacity.max(1));
        let (anomalies, _) = broadcast::channel(capacity.max(1));
        Self {
            aggregates,
            anomalies,
        }
    }

    pub fn subscribe_aggregates(&self) -> broadcast::Receiver<Arc<AggregateRecord>> {
        self.aggregates.subscribe()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Arc<AnomalyAlert>> {
        self.anomalies.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.aggregates.receiver_count() + self.anomalies.receiver_count()
    }
}

#[async_trait]
impl ResultPublisher for BroadcastPublisher {
    async fn publish_aggregate(&self, record: &AggregateRecord) -> SinkResult<()> {
        // No subscribers is not a failure
        if self.aggregates.send(Arc::new(record.clone())).is_err() {
            trace!(target: "tally::sink", "No aggregate subscribers");
        }
        Ok(())
    }

    async fn publish_anomaly(&self, alert: &AnomalyAlert) -> SinkResult<()> {
        if self.anomalies.send(Arc::new(alert.clone())).is_err() {
            trace!(target: "tally::sink", "No anomaly subscribers");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

// ----------------------------------------------------------------------------
// 11.5 NDJSON Publisher
// ----------------------------------------------------------------------------

/// Envelope written per published record
#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    topic: &'a str,
    payload: &'a T,
}

/// Writes `{topic, payload}` lines to any async writer.
#[derive(Debug)]
pub struct NdjsonPublisher<W> {
    writer: tokio::sync::Mutex<W>,
    aggregate_topic: String,
    anomaly_topic: String,
}

pub type StdoutPublisher = NdjsonPublisher<tokio::io::Stdout>;

impl NdjsonPublisher<tokio::io::Stdout> {
    pub fn stdout(outputs: &OutputsConfig) -> Self {
        Self::new(tokio::io::stdout(), outputs)
    }
}

impl<W> NdjsonPublisher<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, outputs: &OutputsConfig) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            aggregate_topic: outputs.aggregate_topic.clone(),
            anomaly_topic: outputs.anomaly_topic.clone(),
        }
    }

    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }

    async fn write<T: Serialize + Sync>(&self, topic: &str, payload: &T) -> SinkResult<()> {
        let mut line = serde_json::to_vec(&Envelope { topic, payload })?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        Ok(())
    }
}

#[async_trait]
impl<W> ResultPublisher for NdjsonPublisher<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Debug,
{
    async fn publish_aggregate(&self, record: &AggregateRecord) -> SinkResult<()> {
        self.write(&self.aggregate_topic, record).await
    }

    async fn publish_anomaly(&self, alert: &AnomalyAlert) -> SinkResult<()> {
        self.write(&self.anomaly_topic, alert).await
    }

    async fn flush(&self) -> SinkResult<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ndjson"
    }
}

// ----------------------------------------------------------------------------
// 11.6 Fan-out Publisher
// ----------------------------------------------------------------------------

/// Publishes to every inner publisher; reports the first failure after
/// trying all of them.
#[derive(Debug, Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn ResultPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn ResultPublisher>>) -> Self {
        Self { publishers }
    }

    fn first_error(results: Vec<SinkResult<()>>) -> SinkResult<()> {
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ResultPublisher for FanoutPublisher {
    async fn publish_aggregate(&self, record: &AggregateRecord) -> SinkResult<()> {
        let results =
            futures::future::join_all(self.publishers.iter().map(|p| p.publish_aggregate(record))).await;
        Self::first_error(results)
    }

    async fn publish_anomaly(&self, alert: &AnomalyAlert) -> SinkResult<()> {
        let results =
            futures::future::join_all(self.publishers.iter().map(|p| p.publish_anomaly(alert))).await;
        Self::first_error(results)
    }

    async fn flush(&self) -> SinkResult<()> {
        let results = futures::future::join_all(self.publishers.iter().map(|p| p.flush())).await;
        Self::first_error(results)
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

// ----------------------------------------------------------------------------
// 11.7 Bounded Calls
// ----------------------------------------------------------------------------

/// Run `call` under `limit`, retrying once on a recoverable failure.
pub async fn bounded<T, F, Fut>(operation: &'static str, limit: Duration, call: F) -> SinkResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = SinkResult<T>>,
{
    let timeout_ms = limit.as_millis() as u64;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(limit, call()).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                operation,
                timeout_ms,
            }),
        };
        match result {
            Err(e) if attempt < 2 && e.is_recoverable() => {
                debug!(target: "tally::sink", operation, error = %e, "Retrying sink call");
            }
            other => return other,
        }
    }
}

// ----------------------------------------------------------------------------
// 11.8 Batch Flusher
// ----------------------------------------------------------------------------

/// Outcome of flushing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub events: usize,
    pub aggregates: usize,
    pub failures: usize,
}

/// Turns flushed batches into persisted and published aggregates.
#[derive(Debug)]
pub struct BatchFlusher {
    sink: Arc<dyn PersistenceSink>,
    publisher: Arc<dyn ResultPublisher>,
    metrics: EngineMetrics,
    errors: Arc<ErrorStats>,
    durability: Durability,
    call_timeout: Duration,
}

impl BatchFlusher {
    pub fn new(
        sink: Arc<dyn PersistenceSink>,
        publisher: Arc<dyn ResultPublisher>,
        metrics: EngineMetrics,
        errors: Arc<ErrorStats>,
        config: &SinkConfig,
    ) -> Self {
        Self {
            sink,
            publisher,
            metrics,
            errors,
            durability: config.durability,
            call_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn publisher(&self) -> &Arc<dyn ResultPublisher> {
        &self.publisher
    }

    /// Aggregate, persist and publish one batch. Failures are logged and
    /// counted, never returned; one bad batch does not affect other keys.
    pub async fn flush(&self, key: &BatchKey, trigger: FlushTrigger, events: Vec<AnalyticsEvent>) -> FlushReport {
        let timer = PerfTimer::with_threshold("flush", SLOW_FLUSH_THRESHOLD_MS);
        let mut report = FlushReport {
            events: events.len(),
            ..Default::default()
        };
        self.metrics.record_flush(trigger);

        // Durable mode already persisted each event before its commit
        if self.durability == Durability::BestEffort {
            if let Err(e) = self.persist_events(&events).await {
                report.failures += 1;
                self.fail(
                    "persist_events",
                    FlushError::Persist {
                        key: key.to_string(),
                        what: "events",
                        source: e,
                    },
                );
            }
        }

        let flushed_at = Utc::now();
        for (event_type, group) in group_by_type(events) {
            let record = match aggregate(key, &event_type, &group, flushed_at) {
                Ok(record) => record,
                Err(e) => {
                    report.failures += 1;
                    self.fail("aggregate", e);
                    continue;
                }
            };
            report.aggregates += 1;
            self.metrics.record_aggregate();
            let record = &record;

            let sink = self.sink.as_ref();
            let persisted = bounded("persist_aggregate", self.call_timeout, move || {
                sink.persist_aggregate(record)
            })
            .await;
            if let Err(e) = persisted {
                report.failures += 1;
                self.fail(
                    "persist_aggregate",
                    FlushError::Persist {
                        key: key.to_string(),
                        what: "aggregate",
                        source: e,
                    },
                );
            }

            let publisher = self.publisher.as_ref();
            let published = bounded("publish_aggregate", self.call_timeout, move || {
                publisher.publish_aggregate(record)
            })
            .await;
            if let Err(e) = published {
                report.failures += 1;
                self.fail(
                    "publish_aggregate",
                    FlushError::Publish {
                        key: key.to_string(),
                        source: e,
                    },
                );
            }
        }

        let elapsed_ms = timer.stop();
        log_flush!(
            key,
            trigger,
            report.events,
            aggregates = report.aggregates,
            failures = report.failures,
            elapsed_ms
        );
        report
    }

    /// Persist raw events under the call timeout.
    pub async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize> {
        let sink = self.sink.as_ref();
        bounded("persist_events", self.call_timeout, move || sink.persist_events(events)).await
    }

    /// Publish an alert. Failures are logged and counted.
    pub async fn publish_alert(&self, alert: &AnomalyAlert) -> bool {
        let publisher = self.publisher.as_ref();
        match bounded("publish_anomaly", self.call_timeout, move || publisher.publish_anomaly(alert)).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_sink_failure("publish_anomaly");
                warn!(
                    target: "tally::sink",
                    event_type = %alert.event_type,
                    error = %e,
                    "Failed to publish anomaly alert"
                );
                self.errors.record(&e.into());
                false
            }
        }
    }

    fn fail(&self, operation: &'static str, error: FlushError) {
        self.metrics.record_sink_failure(operation);
        error!(target: "tally::flush", operation, error = %error, "Flush step failed");
        self.errors.record(&error.into());
    }
}

#[cfg(test)]
mod sink_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` aggregate writes.
    #[derive(Debug)]
    struct FlakySink {
        inner: MemorySink,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceSink for FlakySink {
        async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize> {
            self.inner.persist_events(events).await
        }

        async fn persist_aggregate(&self, record: &AggregateRecord) -> SinkResult<bool> {
            if self.failures.load(AtomicOrdering::SeqCst) > 0 {
                self.failures.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(SinkError::write("flaky", "disk hiccup"));
            }
            self.inner.persist_aggregate(record).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn flusher_with(sink: Arc<dyn PersistenceSink>) -> (BatchFlusher, EngineMetrics) {
        let metrics = EngineMetrics::new().unwrap();
        let flusher = BatchFlusher::new(
            sink,
            Arc::new(BroadcastPublisher::new(16)),
            metrics.clone(),
            Arc::new(ErrorStats::default()),
            &SinkConfig::default(),
        );
        (flusher, metrics)
    }

    fn batch() -> Vec<AnalyticsEvent> {
        vec![
            AnalyticsEvent::new("a", EventType::EmailSent).with_metadata("campaignId", "C1"),
            AnalyticsEvent::new("b", EventType::EmailOpened)
                .with_entity("m1")
                .with_metadata("campaignId", "C1"),
            AnalyticsEvent::new("c", EventType::EmailSent).with_metadata("campaignId", "C1"),
        ]
    }

    #[tokio::test]
    async fn test_memory_sink_is_idempotent() {
        let sink = MemorySink::new();
        assert_eq!(sink.persist_events(&batch()).await.unwrap(), 3);
        assert_eq!(sink.persist_events(&batch()).await.unwrap(), 0);
        assert_eq!(sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_flush_emits_one_record_per_type() {
        let sink = Arc::new(MemorySink::new());
        let (flusher, metrics) = flusher_with(sink.clone());
        let report = flusher.flush(&BatchKey::new("email:C1"), FlushTrigger::Manual, batch()).await;

        assert_eq!(
            report,
            FlushReport {
                events: 3,
                aggregates: 2,
                failures: 0
            }
        );
        let counts: Vec<_> = sink
            .aggregates()
            .iter()
            .map(|r| (r.event_type.clone(), r.count))
            .collect();
        assert_eq!(counts, vec![(EventType::EmailSent, 2), (EventType::EmailOpened, 1)]);
        assert_eq!(sink.events().len(), 3);
        assert_eq!(metrics.flushes(FlushTrigger::Manual), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_retried_once() {
        let sink = Arc::new(FlakySink {
            inner: MemorySink::new(),
            failures: AtomicUsize::new(1),
        });
        let (flusher, metrics) = flusher_with(sink.clone());
        let events = vec![AnalyticsEvent::new("a", EventType::SystemError)];
        let report = flusher
            .flush(&BatchKey::new("system:SYSTEM_ERROR"), FlushTrigger::Timer, events)
            .await;
        assert_eq!(report.failures, 0);
        assert_eq!(sink.inner.aggregates().len(), 1);
        assert_eq!(metrics.sink_failures("persist_aggregate"), 0);

        sink.failures.store(2, AtomicOrdering::SeqCst);
        let events = vec![AnalyticsEvent::new("b", EventType::SystemError)];
        let report = flusher
            .flush(&BatchKey::new("system:SYSTEM_ERROR"), FlushTrigger::Timer, events)
            .await;
        assert_eq!(report.failures, 1);
        assert_eq!(metrics.sink_failures("persist_aggregate"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_call_times_out() {
        let result: SinkResult<()> = bounded("slow", Duration::from_millis(50), || async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(SinkError::Timeout {
                operation: "slow",
                timeout_ms: 50
            })
        ));
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path()).await.unwrap();
        assert_eq!(sink.persist_events(&batch()).await.unwrap(), 3);
        assert_eq!(sink.persist_events(&batch()[..1]).await.unwrap(), 0);

        let record = aggregate(
            &BatchKey::new("email:C1"),
            &EventType::EmailSent,
            &batch()[..1],
            Utc::now(),
        )
        .unwrap();
        assert!(sink.persist_aggregate(&record).await.unwrap());
        assert!(!sink.persist_aggregate(&record).await.unwrap());

        let events = std::fs::read_to_string(dir.path().join(JsonlSink::EVENTS_FILE)).unwrap();
        assert_eq!(events.lines().count(), 3);
        let aggregates = std::fs::read_to_string(dir.path().join(JsonlSink::AGGREGATES_FILE)).unwrap();
        let parsed: AggregateRecord = serde_json::from_str(aggregates.lines().next().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }

    #[tokio::test]
    async fn test_jsonl_retry_after_cancelled_write() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path()).await.unwrap();

        // Cancelled as soon as the write is pending, as a sink timeout would
        let _ = timeout(Duration::ZERO, sink.persist_events(&batch())).await;
        assert_eq!(sink.persist_events(&batch()).await.unwrap(), 0);

        let extra = AnalyticsEvent::new("extra", EventType::EmailSent);
        assert_eq!(sink.persist_events(std::slice::from_ref(&extra)).await.unwrap(), 1);

        let events = std::fs::read_to_string(dir.path().join(JsonlSink::EVENTS_FILE)).unwrap();
        let ids: Vec<String> = events
            .lines()
            .map(|line| serde_json::from_str::<AnalyticsEvent>(line).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids.last().map(String::as_str), Some("extra"));
    }

    #[tokio::test]
    async fn test_ndjson_publisher_envelopes() {
        let publisher = NdjsonPublisher::new(Vec::new(), &OutputsConfig::default());
        let alert = AnomalyAlert::new(EventType::EmailBounced, 35.0, 10.0, AnomalyDirection::Spike, Utc::now());
        publisher.publish_anomaly(&alert).await.unwrap();

        let output = String::from_utf8(publisher.into_writer()).unwrap();
        let line: JsonValue = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["topic"], DEFAULT_ANOMALY_TOPIC);
        assert_eq!(line["payload"]["eventType"], "EMAIL_BOUNCED");
        assert_eq!(line["payload"]["deviation"], 3.5);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(4);
        let alert = AnomalyAlert::new(EventType::SystemError, 1.0, 10.0, AnomalyDirection::Drop, Utc::now());
        assert!(publisher.publish_anomaly(&alert).await.is_ok());

        let mut rx = publisher.subscribe_anomalies();
        publisher.publish_anomaly(&alert).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, alert.id);
    }
}

// ============================================================================
// SECTION 12: BATCH ACCUMULATOR
// ============================================================================
// Keys are hashed onto N lanes. Each lane is a single task that exclusively
// owns the open batches of its keys, so appends, size checks, timer expiry
// and flushes for one key are serialized without per-key locks.
//
//   add_event ──► lane[xxh3(key) % N] ──► OpenBatch ──► BatchFlusher
//                      ▲                      │
//                      └── Expire{gen} ◄── window timer
//
// Events arrive on a bounded queue; timer expiry, flush and close use an
// unbounded control queue that the lane always drains first, so a full
// event queue never delays a window flush.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Lane Commands
// ----------------------------------------------------------------------------

type LaneEvent = (BatchKey, AnalyticsEvent);

#[derive(Debug)]
enum LaneCommand {
    /// Sent by a batch's window timer
    Expire { key: BatchKey, generation: u64 },
    FlushAll {
        trigger: FlushTrigger,
        done: oneshot::Sender<usize>,
    },
    Close { done: oneshot::Sender<usize> },
}

#[derive(Debug)]
struct OpenBatch {
    events: Vec<AnalyticsEvent>,
    generation: u64,
    timer: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// 12.2 Lane Worker
// ----------------------------------------------------------------------------

struct Lane {
    id: usize,
    batch_size: usize,
    window: Duration,
    batches: AHashMap<BatchKey, OpenBatch>,
    /// Lane-wide, so a generation is never reused for a key
    next_generation: u64,
    inbox: FlumeReceiver<LaneEvent>,
    control: FlumeReceiver<LaneCommand>,
    loopback: FlumeSender<LaneCommand>,
    flusher: Arc<BatchFlusher>,
    metrics: EngineMetrics,
}

impl Lane {
    async fn run(mut self) {
        debug!(target: "tally::batch", lane = self.id, "Batch lane started");
        loop {
            let command = tokio::select! {
                biased;
                command = self.control.recv_async() => command,
                event = self.inbox.recv_async() => match event {
                    Ok((key, event)) => {
                        self.add(key, event).await;
                        continue;
                    }
                    Err(_) => break,
                },
            };
            let Ok(command) = command else { break };

            match command {
                LaneCommand::Expire { key, generation } => self.expire(key, generation).await,
                LaneCommand::FlushAll { trigger, done } => {
                    let flushed = self.flush_all(trigger).await;
                    let _ = done.send(flushed);
                }
                LaneCommand::Close { done } => {
                    // Events accepted before close still belong to a batch
                    while let Ok((key, event)) = self.inbox.try_recv() {
                        self.add(key, event).await;
                    }
                    let flushed = self.flush_all(FlushTrigger::Shutdown).await;
                    let _ = done.send(flushed);
                    break;
                }
            }
        }
        debug!(target: "tally::batch", lane = self.id, "Batch lane stopped");
    }

    async fn add(&mut self, key: BatchKey, event: AnalyticsEvent) {
        let len = match self.batches.get_mut(&key) {
            Some(batch) => {
                batch.events.push(event);
                batch.events.len()
            }
            None => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let timer = self.arm_timer(key.clone(), generation);
                self.metrics.batch_opened();
                trace!(target: "tally::batch", lane = self.id, batch_key = %key, generation, "Batch opened");
                self.batches.insert(
                    key.clone(),
                    OpenBatch {
                        events: vec![event],
                        generation,
                        timer,
                    },
                );
                1
            }
        };

        if len >= self.batch_size {
            self.flush_key(&key, FlushTrigger::Size).await;
        }
    }

    fn arm_timer(&self, key: BatchKey, generation: u64) -> JoinHandle<()> {
        let loopback = self.loopback.clone();
        let window = self.window;
        tokio::spawn(async move {
            sleep(window).await;
            let _ = loopback.send(LaneCommand::Expire { key, generation });
        })
    }

    async fn expire(&mut self, key: BatchKey, generation: u64) {
        match self.batches.get(&key) {
            Some(batch) if batch.generation == generation => {
                self.flush_key(&key, FlushTrigger::Timer).await;
            }
            _ => trace!(
                target: "tally::batch",
                lane = self.id,
                batch_key = %key,
                generation,
                "Stale flush timer ignored"
            ),
        }
    }

    async fn flush_key(&mut self, key: &BatchKey, trigger: FlushTrigger) -> bool {
        let Some(batch) = self.batches.remove(key) else {
            return false;
        };
        batch.timer.abort();
        self.metrics.batch_closed();
        if batch.events.is_empty() {
            return false;
        }
        self.flusher.flush(key, trigger, batch.events).await;
        true
    }

    async fn flush_all(&mut self, trigger: FlushTrigger) -> usize {
        let mut keys: Vec<BatchKey> = self.batches.keys().cloned().collect();
        keys.sort();
        let mut flushed = 0;
        for key in keys {
            if self.flush_key(&key, trigger).await {
                flushed += 1;
            }
        }
        flushed
    }
}

// ----------------------------------------------------------------------------
// 12.3 Accumulator Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct LaneHandle {
    events: FlumeSender<LaneEvent>,
    control: FlumeSender<LaneCommand>,
}

/// Routes events to batch lanes and drives manual and shutdown flushes.
#[derive(Debug)]
pub struct BatchAccumulator {
    lanes: Vec<LaneHandle>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    enqueue_grace: Duration,
    metrics: EngineMetrics,
    closed: AtomicBool,
}

impl BatchAccumulator {
    /// Spawn `lanes` lane tasks on the current runtime.
    pub fn spawn(config: &BatchingConfig, lanes: usize, flusher: Arc<BatchFlusher>, metrics: EngineMetrics) -> Self {
        let lanes = lanes.clamp(1, MAX_LANES);
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);

        for id in 0..lanes {
            let (events, inbox) = flume::bounded(config.lane_capacity.max(1));
            let (control, control_rx) = flume::unbounded();
            let lane = Lane {
                id,
                batch_size: config.batch_size.max(1),
                window: config.window(),
                batches: AHashMap::new(),
                next_generation: 0,
                inbox,
                control: control_rx,
                loopback: control.clone(),
                flusher: flusher.clone(),
                metrics: metrics.clone(),
            };
            handles.push(tokio::spawn(lane.run()));
            senders.push(LaneHandle { events, control });
        }

        info!(
            target: "tally::batch",
            lanes,
            batch_size = config.batch_size,
            batch_window_ms = config.batch_window_ms,
            "Batch accumulator started"
        );

        Self {
            lanes: senders,
            handles: Mutex::new(handles),
            enqueue_grace: Duration::from_millis(config.enqueue_grace_ms),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane that owns `key`. Stable for the life of the accumulator.
    pub fn lane_for(&self, key: &BatchKey) -> usize {
        (xxh3_64(key.as_str().as_bytes()) % self.lanes.len() as u64) as usize
    }

    /// Append `event` to the batch for `key`. Waits at most the enqueue grace
    /// period for room in the lane, then drops the event.
    pub async fn add_event(&self, key: BatchKey, event: AnalyticsEvent) -> Result<(), BatchError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(BatchError::Closed);
        }
        let lane = self.lane_for(&key);
        match timeout(self.enqueue_grace, self.lanes[lane].events.send_async((key, event))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BatchError::Closed),
            Err(_) => {
                self.metrics.record_dropped("backpressure");
                let waited_ms = self.enqueue_grace.as_millis() as u64;
                warn!(target: "tally::batch", lane, waited_ms, "Batch lane full, event dropped");
                Err(BatchError::Backpressure { lane, waited_ms })
            }
        }
    }

    /// Flush every open batch now, regardless of size or age.
    pub async fn flush_all(&self) -> usize {
        self.broadcast(|done| LaneCommand::FlushAll {
            trigger: FlushTrigger::Manual,
            done,
        })
        .await
    }

    /// Flush every open batch and stop all lanes. Returns the number of
    /// batches flushed. Later calls are no-ops.
    pub async fn close(&self) -> usize {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return 0;
        }
        let flushed = self.broadcast(|done| LaneCommand::Close { done }).await;

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(target: "tally::batch", error = %e, "Batch lane task failed");
            }
        }
        info!(target: "tally::batch", batches = flushed, "Batch accumulator closed");
        flushed
    }

    async fn broadcast<F>(&self, command: F) -> usize
    where
        F: Fn(oneshot::Sender<usize>) -> LaneCommand,
    {
        let mut replies = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let (done, reply) = oneshot::channel();
            if lane.control.send(command(done)).is_ok() {
                replies.push(reply);
            }
        }
        let mut total = 0;
        for reply in replies {
            total += reply.await.unwrap_or(0);
        }
        total
    }
}


// ============================================================================
// SECTION 13: BROKER SOURCES & DECODING
// ============================================================================
// One `EventSource` per partition. Sources deliver in partition order and
// accept commits of processed offsets; connection loss surfaces as a
// `BrokerError` and is recovered by the ingestion loop.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Event Source Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait EventSource: Send + Debug {
    /// `topic/partition`, for logs
    fn name(&self) -> String;

    /// Next message, or `None` once the stream has ended.
    async fn next(&mut self) -> BrokerResult<Option<InboundMessage>>;

    /// Mark everything up to and including `offset` as processed.
    async fn commit(&mut self, offset: u64) -> BrokerResult<()>;

    async fn reconnect(&mut self) -> BrokerResult<()>;

    async fn close(&mut self) -> BrokerResult<()>;
}

// ----------------------------------------------------------------------------
// 13.2 In-Memory Broker
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PartitionLog {
    sender: Mutex<Option<FlumeSender<InboundMessage>>>,
    receiver: FlumeReceiver<InboundMessage>,
    next_offset: AtomicU64,
    /// Makes the next read fail with a connection loss
    fault: AtomicBool,
}

#[derive(Debug)]
struct BrokerState {
    topic: String,
    partitions: Vec<PartitionLog>,
    /// Next offset to read per partition, as committed by consumers
    committed: DashMap<u32, u64>,
}

/// In-process broker with ordered partitions and committed-offset tracking.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                let (tx, rx) = flume::unbounded();
                PartitionLog {
                    sender: Mutex::new(Some(tx)),
                    receiver: rx,
                    next_offset: AtomicU64::new(0),
                    fault: AtomicBool::new(false),
                }
            })
            .collect();
        Self {
            state: Arc::new(BrokerState {
                topic: topic.into(),
                partitions,
                committed: DashMap::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.state.partitions.len() as u32
    }

    /// Append a payload, returning its offset. `None` once sealed.
    pub fn publish(&self, partition: u32, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let log = self.state.partitions.get(partition as usize)?;
        let sender = log.sender.lock();
        let sender = sender.as_ref()?;
        let offset = log.next_offset.fetch_add(1, AtomicOrdering::SeqCst);
        let message = InboundMessage::new(self.state.topic.clone(), partition, offset, payload);
        sender.send(message).ok()?;
        Some(offset)
    }

    /// Stop accepting messages; sources end after draining what is queued.
    pub fn seal(&self) {
        for log in &self.state.partitions {
            log.sender.lock().take();
        }
    }

    /// Next offset a consumer of `partition` would resume from.
    pub fn committed(&self, partition: u32) -> Option<u64> {
        self.state.committed.get(&partition).map(|offset| *offset)
    }

    /// Fail the next read on `partition` as if the connection dropped.
    pub fn inject_disconnect(&self, partition: u32) {
        if let Some(log) = self.state.partitions.get(partition as usize) {
            log.fault.store(true, AtomicOrdering::SeqCst);
        }
    }

    pub fn source(&self, partition: u32) -> Option<MemorySource> {
        let log = self.state.partitions.get(partition as usize)?;
        Some(MemorySource {
            state: self.state.clone(),
            partition,
            receiver: log.receiver.clone(),
            closed: false,
        })
    }

    /// One source per partition, boxed for the engine.
    pub fn sources(&self) -> Vec<Box<dyn EventSource>> {
        (0..self.partitions())
            .filter_map(|p| self.source(p))
            .map(|s| Box::new(s) as Box<dyn EventSource>)
            .collect()
    }
}

#[derive(Debug)]
pub struct MemorySource {
    state: Arc<BrokerState>,
    partition: u32,
    receiver: FlumeReceiver<InboundMessage>,
    closed: bool,
}

impl MemorySource {
    fn log(&self) -> &PartitionLog {
        &self.state.partitions[self.partition as usize]
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn name(&self) -> String {
        format!("{}/{}", self.state.topic, self.partition)
    }

    async fn next(&mut self) -> BrokerResult<Option<InboundMessage>> {
        if self.closed {
            return Err(BrokerError::Closed {
                source_name: self.name(),
            });
        }
        if self.log().fault.swap(false, AtomicOrdering::SeqCst) {
            return Err(BrokerError::ConnectionLost {
                source_name: self.name(),
                message: "connection reset".into(),
            });
        }
        Ok(self.receiver.recv_async().await.ok())
    }

    async fn commit(&mut self, offset: u64) -> BrokerResult<()> {
        self.state
            .committed
            .entry(self.partition)
            .and_modify(|next| *next = (*next).max(offset + 1))
            .or_insert(offset + 1);
        Ok(())
    }

    async fn reconnect(&mut self) -> BrokerResult<()> {
        if self.closed {
            return Err(BrokerError::Closed {
                source_name: self.name(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 13.3 Line Source (files & stdin)
// ----------------------------------------------------------------------------

/// NDJSON lines from a file or stdin as one partition; offset = line number.
pub struct LineSource {
    topic: String,
    partition: u32,
    lines: Lines<Box<dyn AsyncBufRead + Unpin + Send>>,
    next_offset: u64,
    committed: Option<u64>,
    closed: bool,
}

impl Debug for LineSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSource")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("next_offset", &self.next_offset)
            .field("committed", &self.committed)
            .finish()
    }
}

impl LineSource {
    pub fn new(topic: impl Into<String>, partition: u32, reader: Box<dyn AsyncBufRead + Unpin + Send>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            lines: reader.lines(),
            next_offset: 0,
            committed: None,
            closed: false,
        }
    }

    pub async fn open(path: impl AsRef<Path>, topic: impl Into<String>, partition: u32) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        Ok(Self::new(topic, partition, Box::new(TokioBufReader::new(file))))
    }

    pub fn stdin(topic: impl Into<String>) -> Self {
        Self::new(topic, 0, Box::new(TokioBufReader::new(tokio::io::stdin())))
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }
}

#[async_trait]
impl EventSource for LineSource {
    fn name(&self) -> String {
        format!("{}/{}", self.topic, self.partition)
    }

    async fn next(&mut self) -> BrokerResult<Option<InboundMessage>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| BrokerError::ConnectionLost {
                    source_name: self.name(),
                    message: e.to_string(),
                })?;
            let Some(line) = line else {
                return Ok(None);
            };
            let offset = self.next_offset;
            self.next_offset += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(InboundMessage::new(
                self.topic.clone(),
                self.partition,
                offset,
                line.into_bytes(),
            )));
        }
    }

    async fn commit(&mut self, offset: u64) -> BrokerResult<()> {
        self.committed = Some(self.committed.map_or(offset, |c| c.max(offset)));
        Ok(())
    }

    async fn reconnect(&mut self) -> BrokerResult<()> {
        // A consumed stream cannot be reopened
        Err(BrokerError::Closed {
            source_name: self.name(),
        })
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 13.4 Decoding
// ----------------------------------------------------------------------------

/// Wire shape of an inbound event. Lenient: ids may be strings or numbers,
/// unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    entity_id: Option<JsonValue>,
    #[serde(default)]
    user_id: Option<JsonValue>,
    #[serde(default)]
    metadata: Option<JsonValue>,
    #[serde(default)]
    timestamp: Option<JsonValue>,
}

fn wire_label(value: Option<JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.is_empty() => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode one broker message. `received_at` stands in for a missing timestamp.
pub fn decode_event(message: &InboundMessage, received_at: DateTime<Utc>) -> Result<AnalyticsEvent, DecodeError> {
    let wire: WireEvent = serde_json::from_slice(&message.payload).map_err(|e| DecodeError::Malformed {
        position: message.position(),
        message: e.to_string(),
    })?;

    let event_type = match wire.event_type {
        Some(name) if !name.trim().is_empty() => EventType::from(name),
        _ => {
            return Err(DecodeError::MissingEventType {
                position: message.position(),
            })
        }
    };

    let timestamp = match wire.timestamp {
        None | Some(JsonValue::Null) => received_at,
        Some(JsonValue::String(raw)) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| DecodeError::InvalidTimestamp {
                position: message.position(),
                value: raw.clone(),
                message: e.to_string(),
            })?,
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| DecodeError::InvalidTimestamp {
                position: message.position(),
                value: n.to_string(),
                message: "not epoch milliseconds".into(),
            })?,
        Some(other) => {
            return Err(DecodeError::InvalidTimestamp {
                position: message.position(),
                value: other.to_string(),
                message: "expected ISO-8601 string".into(),
            })
        }
    };

    let metadata = match wire.metadata {
        Some(JsonValue::Object(map)) => EventMetadata::from(map),
        _ => EventMetadata::new(),
    };

    Ok(AnalyticsEvent {
        id: wire_label(wire.id).unwrap_or_else(|| message.fallback_event_id()),
        event_type,
        entity_id: wire_label(wire.entity_id),
        user_id: wire_label(wire.user_id),
        metadata,
        timestamp,
    })
}

// ----------------------------------------------------------------------------
// 13.5 Reconnect Backoff
// ----------------------------------------------------------------------------

/// Doubling delay between `base` and `max`, reset after a success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod broker_tests {
    use super::*;
    use chrono::TimeZone;

    fn message(offset: u64, payload: &str) -> InboundMessage {
        InboundMessage::new("analytics.events", 2, offset, payload)
    }

    #[test]
    fn test_decode_full_event() {
        let payload = r#"{
            "id": "evt-1",
            "eventType": "EMAIL_CLICKED",
            "entityId": "msg-9",
            "userId": 42,
            "metadata": {"campaignId": "C1", "link": "https://x"},
            "timestamp": "2024-03-09T12:00:05Z"
        }"#;
        let event = decode_event(&message(7, payload), Utc::now()).unwrap();
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.event_type, EventType::EmailClicked);
        assert_eq!(event.user_id.as_deref(), Some("42"));
        assert_eq!(event.metadata.link().as_deref(), Some("https://x"));
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 5).unwrap());
    }

    #[test]
    fn test_decode_defaults() {
        let received = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = decode_event(&message(3, r#"{"eventType":"SYSTEM_INFO"}"#), received).unwrap();
        assert_eq!(event.id, "analytics.events-2-3");
        assert_eq!(event.timestamp, received);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        let now = Utc::now();
        assert!(matches!(
            decode_event(&message(0, "{not json"), now),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            decode_event(&message(0, r#"{"entityId":"x"}"#), now),
            Err(DecodeError::MissingEventType { .. })
        ));
        assert!(matches!(
            decode_event(&message(0, r#"{"eventType":"EMAIL_SENT","timestamp":"yesterday"}"#), now),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            decode_event(&message(0, "[1,2,3]"), now),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_memory_broker_delivers_in_order() {
        let broker = MemoryBroker::new("analytics.events", 2);
        assert_eq!(broker.publish(1, "a"), Some(0));
        assert_eq!(broker.publish(1, "b"), Some(1));
        broker.seal();
        assert_eq!(broker.publish(1, "c"), None);

        let mut source = broker.source(1).unwrap();
        assert_eq!(source.next().await.unwrap().unwrap().payload, b"a");
        assert_eq!(source.next().await.unwrap().unwrap().offset, 1);
        assert!(source.next().await.unwrap().is_none());

        source.commit(1).await.unwrap();
        source.commit(0).await.unwrap();
        assert_eq!(broker.committed(1), Some(2));
        assert_eq!(broker.committed(0), None);
    }

    #[tokio::test]
    async fn test_line_source_skips_blank_lines() {
        let input = "{\"eventType\":\"EMAIL_SENT\"}\n\n{\"eventType\":\"EMAIL_OPENED\"}\n";
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(TokioBufReader::new(input.as_bytes()));
        let mut source = LineSource::new("stdin", 0, reader);

        let first = source.next().await.unwrap().unwrap();
        let second = source.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 2);
        assert!(source.next().await.unwrap().is_none());
        assert!(source.reconnect().await.is_err());
    }
}

// ============================================================================
// SECTION 14: INGESTION LOOP
// ============================================================================
// One loop per partition. For each message: decode, then batch, count and
// check in that order, then commit the offset. Decode failures are committed
// past; a store outage skips counting and detection for that event only.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Routing Pipeline
// ----------------------------------------------------------------------------

/// What happened to one routed event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub batched: bool,
    pub counted: bool,
    pub alerted: bool,
}

/// Shared by every ingestion loop.
#[derive(Debug)]
pub struct Pipeline {
    accumulator: Arc<BatchAccumulator>,
    counters: EventCounters,
    detector: Arc<AnomalyDetector>,
    flusher: Arc<BatchFlusher>,
    metrics: EngineMetrics,
    errors: Arc<ErrorStats>,
}

impl Pipeline {
    pub fn new(
        accumulator: Arc<BatchAccumulator>,
        counters: EventCounters,
        detector: Arc<AnomalyDetector>,
        flusher: Arc<BatchFlusher>,
        metrics: EngineMetrics,
        errors: Arc<ErrorStats>,
    ) -> Self {
        Self {
            accumulator,
            counters,
            detector,
            flusher,
            metrics,
            errors,
        }
    }

    /// Batch, count and check one event. Only a closed accumulator is an
    /// error; everything else degrades and is reported in the outcome.
    pub async fn route(&self, event: AnalyticsEvent) -> TallyResult<RouteOutcome> {
        let mut outcome = RouteOutcome::default();
        let event_type = event.event_type.clone();

        match self.accumulator.add_event(event.batch_key(), event.clone()).await {
            Ok(()) => outcome.batched = true,
            Err(BatchError::Closed) => return Err(BatchError::Closed.into()),
            Err(e) => self.errors.record(&e.into()),
        }

        if let Err(e) = self.counters.increment(&event).await {
            self.store_failed(e, "increment");
            return Ok(outcome);
        }
        outcome.counted = true;

        if !self.detector.is_enabled() || !event_type.is_anomaly_eligible() {
            return Ok(outcome);
        }
        match self.detector.check_anomaly(&event_type).await {
            Ok(Some(alert)) => {
                self.metrics.record_anomaly(&alert.event_type);
                outcome.alerted = self.flusher.publish_alert(&alert).await;
            }
            Ok(None) => {}
            Err(e) => self.store_failed(e, "anomaly_check"),
        }
        Ok(outcome)
    }

    fn store_failed(&self, error: StoreError, operation: &'static str) {
        self.metrics.record_store_error();
        warn!(target: "tally::counters", operation, error = %error, "Counter store unavailable, skipping");
        self.errors.record(&error.into());
    }
}

// ----------------------------------------------------------------------------
// 14.2 Ingestion Loop
// ----------------------------------------------------------------------------

/// Per-partition counters, returned when a loop ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub source: String,
    pub received: u64,
    pub routed: u64,
    pub decode_errors: u64,
    pub dropped: u64,
    pub reconnects: u64,
    pub last_committed: Option<u64>,
}

enum DurableWrite {
    Persisted,
    Dropped,
    Shutdown,
}

pub struct IngestionLoop {
    source: Box<dyn EventSource>,
    pipeline: Arc<Pipeline>,
    durability: Durability,
    durable_grace: Duration,
    broker_config: BrokerConfig,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
    report: IngestionReport,
}

impl IngestionLoop {
    pub fn new(
        source: Box<dyn EventSource>,
        pipeline: Arc<Pipeline>,
        config: &EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let report = IngestionReport {
            source: source.name(),
            ..Default::default()
        };
        Self {
            source,
            pipeline,
            durability: config.sink.durability,
            durable_grace: Duration::from_millis(config.sink.durable_grace_ms),
            broker_config: config.broker.clone(),
            backoff: ExponentialBackoff::from_config(&config.broker),
            shutdown,
            report,
        }
    }

    /// Consume until the source ends, fails for good, or shutdown is
    /// signalled. Hands the source back so the caller can close it.
    pub async fn run(mut self) -> (IngestionReport, Box<dyn EventSource>) {
        info!(target: "tally::ingest", source = %self.report.source, durability = %self.durability, "Ingestion loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.source.next() => next,
            };

            match next {
                Ok(Some(message)) => {
                    self.backoff.reset();
                    if !self.process(message).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!(target: "tally::ingest", source = %self.report.source, "Event source drained");
                    break;
                }
                Err(e) => {
                    let recoverable = e.is_recoverable();
                    warn!(target: "tally::ingest", source = %self.report.source, error = %e, "Broker error");
                    self.pipeline.errors.record(&e.into());
                    if !recoverable || !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        info!(
            target: "tally::ingest",
            source = %self.report.source,
            received = self.report.received,
            routed = self.report.routed,
            decode_errors = self.report.decode_errors,
            "Ingestion loop stopped"
        );
        (self.report, self.source)
    }

    /// Returns false when the loop must stop without committing.
    async fn process(&mut self, message: InboundMessage) -> bool {
        self.report.received += 1;
        let offset = message.offset;

        match decode_event(&message, Utc::now()) {
            Err(e) => {
                self.report.decode_errors += 1;
                self.pipeline.metrics.record_decode_error();
                warn!(target: "tally::ingest", error = %e, "Dropping undecodable message");
                self.pipeline.errors.record(&e.into());
            }
            Ok(event) => {
                self.pipeline.metrics.record_ingested();
                let route = match self.durability {
                    Durability::BestEffort => true,
                    Durability::Durable => match self.persist_durably(&event).await {
                        DurableWrite::Persisted => true,
                        DurableWrite::Dropped => {
                            self.report.dropped += 1;
                            false
                        }
                        DurableWrite::Shutdown => return false,
                    },
                };
                if route {
                    match self.pipeline.route(event).await {
                        Ok(_) => self.report.routed += 1,
                        Err(e) => {
                            error!(target: "tally::ingest", error = %e, "Routing stopped");
                            return false;
                        }
                    }
                }
            }
        }

        self.commit(offset).await;
        true
    }

    /// Write the raw event before its offset may be committed, retrying
    /// with backoff for at most the durable grace period.
    async fn persist_durably(&mut self, event: &AnalyticsEvent) -> DurableWrite {
        let deadline = tokio::time::Instant::now() + self.durable_grace;
        let mut backoff = ExponentialBackoff::from_config(&self.broker_config);
        let events = std::slice::from_ref(event);

        loop {
            match self.pipeline.flusher.persist_events(events).await {
                Ok(_) => return DurableWrite::Persisted,
                Err(e) => {
                    debug!(target: "tally::ingest", event_id = %event.id, error = %e, "Durable write failed");
                    self.pipeline.metrics.record_sink_failure("persist_events");
                    self.pipeline.errors.record(&e.into());
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.pipeline.metrics.record_dropped("durable_timeout");
                warn!(
                    target: "tally::ingest",
                    event_id = %event.id,
                    grace_ms = self.durable_grace.as_millis() as u64,
                    "Event could not be persisted in time, dropped"
                );
                return DurableWrite::Dropped;
            }

            let delay = backoff.next_delay().min(deadline - now);
            tokio::select! {
                _ = self.shutdown.cancelled() => return DurableWrite::Shutdown,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn commit(&mut self, offset: u64) {
        match self.source.commit(offset).await {
            Ok(()) => self.report.last_committed = Some(offset),
            Err(e) => {
                // The next successful commit covers this offset
                warn!(target: "tally::ingest", offset, error = %e, "Offset commit failed");
                self.pipeline.errors.record(&e.into());
            }
        }
    }

    async fn reconnect(&mut self) -> bool {
        loop {
            let delay = self.backoff.next_delay();
            info!(
                target: "tally::ingest",
                source = %self.report.source,
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempts(),
                "Reconnecting"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(delay) => {}
            }

            match self.source.reconnect().await {
                Ok(()) => {
                    self.report.reconnects += 1;
                    info!(target: "tally::ingest", source = %self.report.source, "Reconnected");
                    return true;
                }
                Err(e) => {
                    let recoverable = e.is_recoverable();
                    self.pipeline.errors.record(&e.into());
                    if !recoverable {
                        warn!(target: "tally::ingest", source = %self.report.source, "Source cannot reconnect");
                        return false;
                    }
                }
            }
        }
    }
}

// ============================================================================
// SECTION 15: ENGINE & LIFECYCLE
// ============================================================================
// Wires the components together and owns start/stop ordering:
//   1. stop pulling from sources
//   2. wait (bounded) for in-flight messages
//   3. flush every open batch
//   4. flush publishers
//   5. close sources
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Components, State & Reports
// ----------------------------------------------------------------------------

/// Pluggable backends
#[derive(Debug, Clone)]
pub struct EngineComponents {
    pub store: Arc<dyn CounterStore>,
    pub sink: Arc<dyn PersistenceSink>,
    pub publisher: Arc<dyn ResultPublisher>,
}

impl EngineComponents {
    /// Everything in-process
    pub fn in_memory(outputs: &OutputsConfig) -> Self {
        Self {
            store: Arc::new(MemoryCounterStore::new()),
            sink: Arc::new(MemorySink::new()),
            publisher: Arc::new(BroadcastPublisher::new(outputs.broadcast_capacity)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded { reasons: Vec<String> },
    Stopped,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub uptime_secs: u64,
    pub events_ingested: u64,
    pub decode_errors: u64,
    pub dropped_backpressure: u64,
    pub dropped_durable: u64,
    pub aggregates_emitted: u64,
    pub store_errors: u64,
    pub open_batches: i64,
    pub anomaly_baselines: usize,
    pub errors_total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub batches_flushed: usize,
    pub ingestion: Vec<IngestionReport>,
    pub elapsed_ms: u64,
}

type LoopHandle = JoinHandle<(IngestionReport, Box<dyn EventSource>)>;

// ----------------------------------------------------------------------------
// 15.2 Engine
// ----------------------------------------------------------------------------

pub struct Engine {
    config: EngineConfig,
    metrics: EngineMetrics,
    errors: Arc<ErrorStats>,
    counters: EventCounters,
    detector: Arc<AnomalyDetector>,
    flusher: Arc<BatchFlusher>,
    accumulator: Arc<BatchAccumulator>,
    pipeline: Arc<Pipeline>,
    broadcast: Option<Arc<BroadcastPublisher>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    loops: Mutex<Vec<LoopHandle>>,
    state: Mutex<EngineState>,
    started_at: Instant,
}

impl Engine {
    /// Build an engine over the given backends. Spawns the batch lanes, so
    /// it must run inside a tokio runtime.
    pub fn new(config: EngineConfig, components: EngineComponents) -> TallyResult<Self> {
        config.validate()?;
        let metrics = EngineMetrics::new().map_err(|e| TallyError::Internal(format!("metrics registry: {}", e)))?;
        let errors = Arc::new(ErrorStats::new(Duration::from_secs(config.health.window_secs)));

        let counters = EventCounters::new(components.store.clone(), config.store.key_prefix.clone());
        let detector = Arc::new(AnomalyDetector::new(counters.clone(), config.anomaly_detection.clone()));
        let flusher = Arc::new(BatchFlusher::new(
            components.sink.clone(),
            components.publisher.clone(),
            metrics.clone(),
            errors.clone(),
            &config.sink,
        ));
        let accumulator = Arc::new(BatchAccumulator::spawn(
            &config.batching,
            config.effective_lanes(),
            flusher.clone(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            accumulator.clone(),
            counters.clone(),
            detector.clone(),
            flusher.clone(),
            metrics.clone(),
            errors.clone(),
        ));

        info!(
            target: "tally::engine",
            instance = %config.engine.instance_name,
            store = components.store.backend(),
            sink = components.sink.name(),
            publisher = components.publisher.name(),
            durability = %config.sink.durability,
            anomaly_detection = config.anomaly_detection.enabled,
            "Engine assembled"
        );

        Ok(Self {
            config,
            metrics,
            errors,
            counters,
            detector,
            flusher,
            accumulator,
            pipeline,
            broadcast: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
            state: Mutex::new(EngineState::Created),
            started_at: Instant::now(),
        })
    }

    /// Build from configuration alone: Redis when `store.redis_url` is set,
    /// JSONL files when `sink.directory` is set, broadcast plus optional
    /// stdout publishing.
    pub async fn build(config: EngineConfig) -> TallyResult<Self> {
        let store: Arc<dyn CounterStore> = match &config.store.redis_url {
            Some(url) => redis_store(url, config.store.timeout_ms).await?,
            None => Arc::new(MemoryCounterStore::new()),
        };
        let sink: Arc<dyn PersistenceSink> = match &config.sink.directory {
            Some(directory) => Arc::new(JsonlSink::open(directory).await?),
            None => Arc::new(MemorySink::new()),
        };

        let broadcast = Arc::new(BroadcastPublisher::new(config.outputs.broadcast_capacity));
        let publisher: Arc<dyn ResultPublisher> = if config.outputs.stdout {
            let stdout: Arc<dyn ResultPublisher> = Arc::new(StdoutPublisher::stdout(&config.outputs));
            let broadcast: Arc<dyn ResultPublisher> = broadcast.clone();
            Arc::new(FanoutPublisher::new(vec![broadcast, stdout]))
        } else {
            broadcast.clone()
        };

        let mut engine = Self::new(
            config,
            EngineComponents {
                store,
                sink,
                publisher,
            },
        )?;
        engine.broadcast = Some(broadcast);
        Ok(engine)
    }

    /// Spawn one ingestion loop per source.
    pub fn start(&self, sources: Vec<Box<dyn EventSource>>) -> TallyResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Stopping | EngineState::Stopped => return Err(TallyError::ShuttingDown),
                _ => *state = EngineState::Running,
            }
        }

        let mut loops = self.loops.lock();
        for source in sources {
            let ingestion = IngestionLoop::new(source, self.pipeline.clone(), &self.config, self.shutdown.child_token());
            loops.push(self.tracker.spawn(ingestion.run()));
        }
        self.tracker.close();

        info!(target: "tally::engine", sources = loops.len(), version = ENGINE_VERSION, "Engine started");
        Ok(())
    }

    /// Resolves once every ingestion loop has ended on its own.
    pub async fn sources_drained(&self) {
        self.tracker.wait().await;
    }

    /// Run until SIGINT/SIGTERM or until every source is drained, then shut down.
    pub async fn run_until_signal(&self) -> TallyResult<ShutdownReport> {
        tokio::select! {
            signal = shutdown_signal() => match signal {
                Ok(name) => info!(target: "tally::engine", signal = name, "Shutdown signal received"),
                Err(e) => {
                    warn!(target: "tally::engine", error = %e, "Signal handlers unavailable, waiting for sources");
                    self.sources_drained().await;
                }
            },
            _ = self.sources_drained() => {
                info!(target: "tally::engine", "All event sources drained");
            }
        }
        self.shutdown().await
    }

    /// Graceful stop. Every open batch is flushed before sources are closed.
    pub async fn shutdown(&self) -> TallyResult<ShutdownReport> {
        {
            let mut state = self.state.lock();
            if matches!(*state, EngineState::Stopping | EngineState::Stopped) {
                return Err(TallyError::ShuttingDown);
            }
            *state = EngineState::Stopping;
        }
        let started = Instant::now();
        let grace = Duration::from_secs(self.config.engine.shutdown_timeout_secs);
        info!(target: "tally::engine", "Starting graceful shutdown");

        self.shutdown.cancel();
        self.tracker.close();

        let handles: Vec<LoopHandle> = std::mem::take(&mut *self.loops.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut reports = Vec::new();
        let mut sources = Vec::new();
        match timeout(grace, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok((report, source)) => {
                            reports.push(report);
                            sources.push(source);
                        }
                        Err(e) => error!(target: "tally::engine", error = %e, "Ingestion task failed"),
                    }
                }
            }
            Err(_) => {
                warn!(target: "tally::engine", grace_secs = grace.as_secs(), "Ingestion loops did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        let batches_flushed = self.accumulator.close().await;

        let publisher = self.flusher.publisher().clone();
        match timeout(grace, publisher.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "tally::engine", error = %e, "Publisher flush failed"),
            Err(_) => warn!(target: "tally::engine", "Publisher flush timed out"),
        }

        for mut source in sources {
            if let Err(e) = source.close().await {
                warn!(target: "tally::engine", source = %source.name(), error = %e, "Failed to close source");
            }
        }

        *self.state.lock() = EngineState::Stopped;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(target: "tally::engine", batches_flushed, elapsed_ms, "Engine shutdown complete");

        Ok(ShutdownReport {
            batches_flushed,
            ingestion: reports,
            elapsed_ms,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn health(&self) -> HealthStatus {
        if self.state() == EngineState::Stopped {
            return HealthStatus::Stopped;
        }
        let mut reasons = Vec::new();
        let store_errors = self.errors.recent("store");
        if store_errors > self.config.health.store_error_threshold {
            reasons.push(format!("{} counter store errors in the last {}s", store_errors, self.config.health.window_secs));
        }
        let broker_errors = self.errors.recent("broker");
        if broker_errors > self.config.health.broker_error_threshold {
            reasons.push(format!("{} broker errors in the last {}s", broker_errors, self.config.health.window_secs));
        }
        if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded { reasons }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_ingested: self.metrics.ingested(),
            decode_errors: self.metrics.decode_errors(),
            dropped_backpressure: self.metrics.dropped("backpressure"),
            dropped_durable: self.metrics.dropped("durable_timeout"),
            aggregates_emitted: self.metrics.aggregates_emitted(),
            store_errors: self.metrics.store_errors(),
            open_batches: self.metrics.open_batches(),
            anomaly_baselines: self.detector.tracked_types(),
            errors_total: self.errors.total_errors(),
        }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    /// In-process subscription, available on engines made by [`Engine::build`].
    pub fn subscribe_aggregates(&self) -> Option<broadcast::Receiver<Arc<AggregateRecord>>> {
        self.broadcast.as_ref().map(|b| b.subscribe_aggregates())
    }

    pub fn subscribe_anomalies(&self) -> Option<broadcast::Receiver<Arc<AnomalyAlert>>> {
        self.broadcast.as_ref().map(|b| b.subscribe_anomalies())
    }
}

#[cfg(feature = "redis-store")]
async fn redis_store(url: &str, timeout_ms: u64) -> TallyResult<Arc<dyn CounterStore>> {
    Ok(Arc::new(RedisCounterStore::connect(url, timeout_ms).await?))
}

#[cfg(not(feature = "redis-store"))]
async fn redis_store(_url: &str, _timeout_ms: u64) -> TallyResult<Arc<dyn CounterStore>> {
    Err(ConfigError::invalid_value("store.redis_url", "built without the redis-store feature").into())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    /// Every call fails as if Redis were down.
    #[derive(Debug, Default)]
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn execute_atomic(&self, _ops: &[CounterOp]) -> StoreResult<Vec<i64>> {
            Err(StoreError::Unavailable {
                message: "connection refused".into(),
            })
        }

        async fn get(&self, _key: &str) -> StoreResult<i64> {
            Err(StoreError::Unavailable {
                message: "connection refused".into(),
            })
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    /// Refuses raw events whose id starts with `poison`.
    #[derive(Debug, Default)]
    struct PickySink {
        inner: MemorySink,
    }

    #[async_trait]
    impl PersistenceSink for PickySink {
        async fn persist_events(&self, events: &[AnalyticsEvent]) -> SinkResult<usize> {
            if events.iter().any(|e| e.id.starts_with("poison")) {
                return Err(SinkError::write("picky", "rejected"));
            }
            self.inner.persist_events(events).await
        }

        async fn persist_aggregate(&self, record: &AggregateRecord) -> SinkResult<bool> {
            self.inner.persist_aggregate(record).await
        }

        fn name(&self) -> &'static str {
            "picky"
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.batching.lanes = 2;
        config.outputs.stdout = false;
        config
    }

    fn engine_with(config: EngineConfig, store: Arc<dyn CounterStore>, sink: Arc<dyn PersistenceSink>) -> Engine {
        let components = EngineComponents {
            store,
            sink,
            publisher: Arc::new(BroadcastPublisher::new(16)),
        };
        Engine::new(config, components).unwrap()
    }

    fn opened(id: &str, entity: &str) -> String {
        serde_json::json!({
            "id": id,
            "eventType": "EMAIL_OPENED",
            "entityId": entity,
            "metadata": {"campaignId": "C1"}
        })
        .to_string()
    }

    async fn wait_for_commit(broker: &MemoryBroker, partition: u32, next: u64) {
        timeout(Duration::from_secs(5), async {
            while broker.committed(partition) != Some(next) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offsets committed");
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped_and_committed() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(test_config(), Arc::new(MemoryCounterStore::new()), sink.clone());
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        broker.publish(0, opened("e1", "m1"));
        broker.publish(0, "{\"eventType\": ");
        broker.publish(0, opened("e2", "m2"));
        broker.seal();

        engine.start(broker.sources()).unwrap();
        engine.sources_drained().await;
        let report = engine.shutdown().await.unwrap();

        assert_eq!(broker.committed(0), Some(3));
        assert_eq!(report.ingestion[0].decode_errors, 1);
        assert_eq!(report.ingestion[0].routed, 2);
        assert_eq!(report.batches_flushed, 1);

        let records = sink.aggregates();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(engine.stats().decode_errors, 1);
        assert_eq!(engine.health(), HealthStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_batches() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(test_config(), Arc::new(MemoryCounterStore::new()), sink.clone());
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 2);

        broker.publish(0, opened("e1", "m1"));
        broker.publish(
            0,
            r#"{"id":"s1","eventType":"SYSTEM_ERROR","metadata":{"service":"api","errorCode":"E1"}}"#,
        );
        broker.publish(1, r#"{"id":"c1","eventType":"CAMPAIGN_SENT","entityId":"camp-1","metadata":{"recipientCount":10}}"#);

        engine.start(broker.sources()).unwrap();
        wait_for_commit(&broker, 0, 2).await;
        wait_for_commit(&broker, 1, 1).await;
        assert_eq!(engine.state(), EngineState::Running);

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.batches_flushed, 3);
        assert_eq!(sink.aggregates().len(), 3);
        assert_eq!(engine.metrics().flushes(FlushTrigger::Shutdown), 3);
        assert!(matches!(engine.shutdown().await, Err(TallyError::ShuttingDown)));
        assert!(engine.start(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_store_outage_degrades_but_keeps_committing() {
        let mut config = test_config();
        config.health.store_error_threshold = 2;
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(config, Arc::new(DownStore), sink.clone());
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        for i in 0..4 {
            broker.publish(0, opened(&format!("e{}", i), "m"));
        }
        broker.seal();

        engine.start(broker.sources()).unwrap();
        engine.sources_drained().await;

        assert_eq!(broker.committed(0), Some(4));
        assert_eq!(engine.metrics().store_errors(), 4);
        assert!(matches!(engine.health(), HealthStatus::Degraded { .. }));

        engine.shutdown().await.unwrap();
        assert_eq!(sink.aggregates()[0].count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_mode_drops_unpersistable_event() {
        let mut config = test_config();
        config.sink.durability = Durability::Durable;
        config.sink.durable_grace_ms = 500;
        let sink = Arc::new(PickySink::default());
        let engine = engine_with(config, Arc::new(MemoryCounterStore::new()), sink.clone());
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        broker.publish(0, opened("e1", "m1"));
        broker.publish(0, opened("poison-1", "m2"));
        broker.publish(0, opened("e2", "m3"));
        broker.seal();

        engine.start(broker.sources()).unwrap();
        engine.sources_drained().await;
        let report = engine.shutdown().await.unwrap();

        assert_eq!(broker.committed(0), Some(3));
        assert_eq!(report.ingestion[0].dropped, 1);
        assert_eq!(engine.stats().dropped_durable, 1);

        let stored: Vec<_> = sink.inner.events().into_iter().map(|e| e.id).collect();
        assert_eq!(stored, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(sink.inner.aggregates()[0].count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_disconnect_reconnects() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(test_config(), Arc::new(MemoryCounterStore::new()), sink.clone());
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        broker.publish(0, opened("e1", "m1"));
        broker.seal();
        broker.inject_disconnect(0);

        engine.start(broker.sources()).unwrap();
        engine.sources_drained().await;
        let report = engine.shutdown().await.unwrap();

        assert_eq!(report.ingestion[0].reconnects, 1);
        assert_eq!(report.ingestion[0].routed, 1);
        assert_eq!(broker.committed(0), Some(1));
    }

    #[tokio::test]
    async fn test_repeated_disconnects_degrade_health() {
        let mut config = test_config();
        config.health.broker_error_threshold = 2;
        config.broker.reconnect_base_ms = 1;
        config.broker.reconnect_max_ms = 10;
        let engine = engine_with(config, Arc::new(MemoryCounterStore::new()), Arc::new(MemorySink::new()));
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        engine.start(broker.sources()).unwrap();

        for i in 0..3u64 {
            broker.inject_disconnect(0);
            broker.publish(0, opened(&format!("e{}", i), "m"));
            timeout(Duration::from_secs(5), async {
                while engine.stats().errors_total < i + 1 {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("disconnect recorded");
        }
        wait_for_commit(&broker, 0, 3).await;

        match engine.health() {
            HealthStatus::Degraded { reasons } => {
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("broker"));
            }
            other => panic!("expected degraded health, got {:?}", other),
        }

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.ingestion[0].reconnects, 3);
        assert_eq!(report.ingestion[0].routed, 3);
    }

    #[tokio::test]
    async fn test_spike_is_published() {
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let mut alerts = publisher.subscribe_anomalies();
        let engine = Engine::new(
            test_config(),
            EngineComponents {
                store: Arc::new(MemoryCounterStore::new()),
                sink: Arc::new(MemorySink::new()),
                publisher: publisher.clone(),
            },
        )
        .unwrap();

        // A quiet baseline far below whatever rate a burst produces
        let long_ago = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        engine.detector().seed_baseline(EventType::EmailBounced, 0.01, 10, long_ago);
        let broker = MemoryBroker::new(DEFAULT_INPUT_TOPIC, 1);
        for i in 0..5 {
            broker.publish(0, format!(r#"{{"id":"b{}","eventType":"EMAIL_BOUNCED"}}"#, i));
        }
        broker.seal();

        engine.start(broker.sources()).unwrap();
        engine.sources_drained().await;

        let alert = alerts.try_recv().expect("one alert");
        assert_eq!(alert.event_type, EventType::EmailBounced);
        assert_eq!(alert.direction, AnomalyDirection::Spike);
        assert!(alerts.try_recv().is_err());
        assert_eq!(engine.metrics().anomalies(&EventType::EmailBounced), 1);
        engine.shutdown().await.unwrap();
    }
}

// ============================================================================
// SECTION 16: CLI & MAIN ENTRY POINT
// ============================================================================

/// Tally Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "tally",
    author = "Analytics Platform Team",
    version,
    about = "Real-time event aggregation engine",
    long_about = "Tally consumes analytics events, batches them per key, keeps \
                  multi-resolution counters, flags rate anomalies and publishes \
                  aggregates for dashboards and alerting."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tally.toml", env = "TALLY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "TALLY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine over NDJSON inputs (stdin when none are given)
    Run {
        /// Input files, one partition each
        #[arg(short, long)]
        input: Vec<PathBuf>,
    },

    /// Validate configuration
    Validate {
        /// Print the effective configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration
    GenerateConfig {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = load_config(path)?;
    println!("Configuration is valid");
    if verbose {
        print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }
    Ok(())
}

/// File plus environment when the file exists, environment alone otherwise.
fn load_config(path: &Path) -> AnyhowResult<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        EngineConfig::from_env().context("Failed to load config from environment")
    }
}

async fn open_sources(inputs: &[PathBuf], topic: &str) -> AnyhowResult<Vec<Box<dyn EventSource>>> {
    if inputs.is_empty() {
        return Ok(vec![Box::new(LineSource::stdin(topic))]);
    }
    let mut sources: Vec<Box<dyn EventSource>> = Vec::with_capacity(inputs.len());
    for (partition, path) in inputs.iter().enumerate() {
        let source = LineSource::open(path, topic, partition as u32)
            .await
            .with_context(|| format!("Failed to open input {}", path.display()))?;
        sources.push(Box::new(source));
    }
    Ok(sources)
}

async fn handle_run(cli: &Cli, inputs: &[PathBuf]) -> AnyhowResult<()> {
    let config_found = cli.config.exists();
    let config = load_config(&cli.config)?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!(target: "tally::init", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!(target: "tally::init", path = %cli.config.display(), "Config file not found, using defaults and environment");
    }

    let topic = config.broker.topic.clone();
    let engine = Engine::build(config).await?;
    let sources = open_sources(inputs, &topic).await?;
    engine.start(sources)?;

    let report = engine.run_until_signal().await?;
    let stats = engine.stats();
    info!(
        target: "tally::engine",
        batches_flushed = report.batches_flushed,
        events = stats.events_ingested,
        aggregates = stats.aggregates_emitted,
        decode_errors = stats.decode_errors,
        "Run complete"
    );
    debug!(target: "tally::engine", metrics = %engine.metrics().render(), "Final metrics");
    Ok(())
}

/// Main entry point for the Tally engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            Ok(())
        }
        Some(Commands::GenerateConfig { output }) => handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => handle_validate(&cli.config, *verbose),
        Some(Commands::Run { input }) => handle_run(&cli, input).await,
        None => handle_run(&cli, &[]).await,
    }
}
