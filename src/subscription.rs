//! PayPal subscription confirmation.
//!
//! After the PayPal widget approves a subscription the backend still has to
//! confirm it and wait for the billing agreement to activate. This module
//! drives that handshake: one POST to the confirm endpoint, then polling the
//! subscription resource until it leaves its settling state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::gate;
use crate::http::{encode_path_segment, ApiClient, ApiError, ApiResponse};

/// Endpoint the approved subscription id is posted to.
pub const CONFIRM_PATH: &str = "/billing/paypal/confirm";

const DEFAULT_POLL_ATTEMPTS: u32 = 10;
const DEFAULT_POLL_BASE_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle states the billing endpoints report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Suspended,
    Cancelled,
    Failed,
    /// A label this client does not know. Kept verbatim for logs.
    Unknown(String),
}

impl SubscriptionState {
    /// Case-insensitive parse; PayPal itself is inconsistent about casing.
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "pending" | "approval_pending" => Self::Pending,
            "active" => Self::Active,
            "suspended" => Self::Suspended,
            "cancelled" | "canceled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => Self::Unknown(label.to_string()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// States that can still become active, so polling should continue.
    /// Unknown labels are treated as settling rather than as rejections.
    fn is_settling(&self) -> bool {
        matches!(self, Self::Pending | Self::Unknown(_))
    }
}

/// Snapshot of a subscription as the billing endpoints describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub plan_id: Option<String>,
    /// RFC3339; epoch-seconds payloads are converted.
    pub next_billing_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// A confirmation is already running on this flow.
    #[error("a subscription confirmation is already in flight")]
    AlreadyInFlight,
    #[error(transparent)]
    Transport(#[from] ApiError),
    /// The server settled the subscription into a dead state or refused the
    /// confirm outright.
    #[error("subscription rejected: {0}")]
    Rejected(String),
    /// The poll budget ran out with the subscription still settling.
    #[error("subscription still pending after {attempts} status checks")]
    StillPending { attempts: u32 },
}

#[derive(Serialize)]
struct ConfirmRequest<'a> {
    subscription_id: &'a str,
}

/// Claims the in-flight flag for one confirmation. Dropping the guard
/// releases the flag on every exit path, early returns included.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then(|| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the confirm-then-poll handshake against one [`ApiClient`].
pub struct SubscriptionFlow {
    client: Arc<ApiClient>,
    in_flight: AtomicBool,
    poll_attempts: u32,
    poll_base_delay: Duration,
}

impl SubscriptionFlow {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self {
            client,
            in_flight: AtomicBool::new(false),
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_base_delay: DEFAULT_POLL_BASE_DELAY,
        }
    }

    /// Overrides the poll budget. At least one poll always runs.
    pub fn with_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts.max(1);
        self
    }

    /// Overrides the base delay between status checks.
    pub fn with_poll_interval(mut self, base: Duration) -> Self {
        self.poll_base_delay = base;
        self
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Confirms an approved PayPal subscription and polls until it
    /// activates.
    ///
    /// Only one confirmation may run per flow at a time; a second call while
    /// the first is settling fails fast with
    /// [`SubscribeError::AlreadyInFlight`] instead of double-submitting the
    /// same agreement.
    pub async fn confirm_paypal(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, SubscribeError> {
        let _guard = InFlightGuard::acquire(&self.in_flight)
            .ok_or(SubscribeError::AlreadyInFlight)?;

        debug!("confirming paypal subscription {subscription_id}");
        let resp = self
            .client
            .post_json(CONFIRM_PATH, &ConfirmRequest { subscription_id })
            .await?;
        if !resp.is_success() {
            return Err(SubscribeError::Rejected(rejection_message(&resp)));
        }

        // The confirm response sometimes already carries the final state.
        if let Ok(payload) = resp.json::<Value>() {
            if let Some(status) = status_from_payload(&payload) {
                if status.state.is_active() {
                    return Ok(status);
                }
                if !status.state.is_settling() {
                    return Err(SubscribeError::Rejected(format!(
                        "subscription settled as {:?}",
                        status.state
                    )));
                }
            }
        }

        self.poll_until_active(subscription_id).await
    }

    /// One status read with no polling. `Ok(None)` when the subscription is
    /// not visible yet or the body carries no recognizable state.
    pub async fn status(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionStatus>, ApiError> {
        let resp = self.client.get(&status_path(subscription_id)).await?;
        if !resp.is_success() {
            return Ok(None);
        }
        Ok(resp
            .json::<Value>()
            .ok()
            .as_ref()
            .and_then(status_from_payload))
    }

    async fn poll_until_active(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, SubscribeError> {
        let path = status_path(subscription_id);
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(poll_backoff(self.poll_base_delay, attempt)).await;
            match self.client.get(&path).await {
                Ok(resp) if resp.is_success() => {
                    let payload = resp.json::<Value>().ok();
                    if let Some(status) = payload.as_ref().and_then(status_from_payload) {
                        if status.state.is_active() {
                            debug!(
                                "subscription {subscription_id} active after {} status checks",
                                attempt + 1
                            );
                            return Ok(status);
                        }
                        if !status.state.is_settling() {
                            return Err(SubscribeError::Rejected(format!(
                                "subscription settled as {:?}",
                                status.state
                            )));
                        }
                    }
                }
                Ok(resp) if resp.status.as_u16() == 404 => {
                    // The record can lag the PayPal approval; keep waiting.
                    debug!("subscription {subscription_id} not visible yet");
                }
                Ok(resp) if resp.status.is_client_error() => {
                    // Other 4xx will not improve with retries.
                    return Err(SubscribeError::Rejected(rejection_message(&resp)));
                }
                Ok(resp) => {
                    warn!("subscription poll got {}, retrying", resp.status);
                }
                Err(err) => {
                    warn!("subscription poll error: {err}, retrying");
                }
            }
            attempt += 1;
            if attempt >= self.poll_attempts {
                return Err(SubscribeError::StillPending { attempts: attempt });
            }
        }
    }
}

fn status_path(subscription_id: &str) -> String {
    format!(
        "/billing/subscriptions/{}",
        encode_path_segment(subscription_id)
    )
}

fn status_from_payload(payload: &Value) -> Option<SubscriptionStatus> {
    let state = gate::lookup(payload, &["status", "state"])
        .and_then(Value::as_str)
        .map(SubscriptionState::parse)?;
    let plan_id = gate::lookup(payload, &["plan_id"])
        .and_then(Value::as_str)
        .map(str::to_string);
    let next_billing_at =
        gate::lookup(payload, &["next_billing_at", "next_billing_time"]).and_then(billing_time);
    Some(SubscriptionStatus {
        state,
        plan_id,
        next_billing_at,
    })
}

/// Billing timestamps arrive as RFC3339 strings or as epoch seconds.
fn billing_time(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    value
        .as_i64()
        .and_then(|epoch| chrono::DateTime::<chrono::Utc>::from_timestamp(epoch, 0))
        .map(|dt| dt.to_rfc3339())
}

fn rejection_message(resp: &ApiResponse) -> String {
    if let Ok(payload) = resp.json::<Value>() {
        if let Some(msg) = gate::lookup(&payload, &["message", "error"]).and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    format!("confirm endpoint returned {}", resp.status)
}

fn poll_backoff(base: Duration, attempt: u32) -> Duration {
    // Exponential backoff with jitter: base * 2^attempt, capped at 16x base.
    let scaled = (base.as_millis() as u64).saturating_mul(1u64 << attempt.min(4));
    let jitter = fastrand::u64(0..=scaled / 2);
    Duration::from_millis(scaled / 2 + jitter)
}
