//! Passive credit and gating monitor.
//!
//! [`CreditsMonitor`] watches every request that flows through an
//! [`ApiClient`] and keeps a local mirror of the account's credit balance
//! plus the paywall gate state. It never alters a response and never fails
//! a request: everything in this module is best-effort observation layered
//! on top of traffic the application was already sending.

use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use url::Url;

use crate::gate::{self, GateDecision};
use crate::http::{ApiClient, ApiResponse, NetworkObserver, RequestInfo};
use crate::types::{CreditBalance, GateState};

/// Response header carrying the authoritative trial count. When present it
/// wins over any credit field found in the response body.
pub const TRIAL_CREDITS_HEADER: &str = "x-trial-credits-remaining";

/// Path fragments of POST endpoints that consume credits. A request hitting
/// one of these schedules a balance refresh before and after it runs.
const TOOL_ACTION_PATHS: &[&str] = &["/generate", "/regenerate", "/rewrite"];

/// Field names passively observed bodies use for the trial balance, in
/// lookup order. The credits endpoint itself only ever uses
/// `trial_remaining`.
const TRIAL_FIELDS: &[&str] = &["trial_credits_remaining", "trial_remaining"];
const REAL_FIELDS: &[&str] = &["real_remaining"];

#[derive(Default)]
struct MonitorState {
    credits: RwLock<CreditBalance>,
    gate: RwLock<GateState>,
}

impl MonitorState {
    /// Header-sourced trial update. Applied synchronously so a subsequent
    /// read sees the new count even before any refresh lands.
    fn set_trial(&self, trial: u64) {
        let mut credits = self.credits.write();
        credits.trial_remaining = trial;
        credits.is_free_trial = trial > 0;
    }

    /// Full snapshot from the credits endpoint. Missing fields were already
    /// defaulted by the caller, so this replaces both balances.
    fn set_balance(&self, trial: u64, real: u64) {
        *self.credits.write() = CreditBalance::new(trial, real);
    }

    /// Partial update from a passively observed body. Fields that were
    /// absent or malformed keep their previous values.
    fn merge_observed(&self, trial: Option<u64>, real: Option<u64>) {
        if trial.is_none() && real.is_none() {
            return;
        }
        let mut credits = self.credits.write();
        if let Some(t) = trial {
            credits.trial_remaining = t;
        }
        if let Some(r) = real {
            credits.real_remaining = r;
        }
        credits.is_free_trial = credits.trial_remaining > 0;
    }

    fn open_gate(&self, decision: GateDecision) {
        *self.gate.write() = GateState {
            visible: true,
            title: decision.title.to_string(),
            message: decision.message,
        };
    }

    fn set_gate_visible(&self, visible: bool) {
        self.gate.write().visible = visible;
    }
}

/// The [`NetworkObserver`] half of the monitor. Holds the client weakly so
/// an installed observer never keeps its own client alive.
struct MonitorObserver {
    client: Weak<ApiClient>,
    state: Arc<MonitorState>,
    credits_path: String,
}

impl MonitorObserver {
    fn is_credits_endpoint(&self, url: &Url) -> bool {
        url.path() == self.credits_path
    }

    fn is_tool_action(req: &RequestInfo) -> bool {
        req.method == Method::POST
            && TOOL_ACTION_PATHS.iter().any(|p| req.url.path().contains(p))
    }

    fn qualifies_for_refresh(&self, req: &RequestInfo) -> bool {
        Self::is_tool_action(req) && !self.is_credits_endpoint(&req.url)
    }

    /// Schedules a background balance refresh. The task owns its own handle
    /// to the client and discards any outcome; a failed refresh only leaves
    /// the mirror slightly stale.
    fn spawn_refresh(&self, phase: &'static str) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let state = Arc::clone(&self.state);
        debug!("credits refresh scheduled ({phase})");
        tokio::spawn(async move {
            refresh_balance(&client, &state).await;
        });
    }

    fn raise_gate(&self, req: &RequestInfo, decision: GateDecision) {
        warn!(
            "gate raised by {} {}: {}",
            req.method,
            req.url.path(),
            decision.title
        );
        self.state.open_gate(decision);
    }

    /// Non-402 JSON body handling: merge any credit fields, then classify
    /// unless the payload declares itself a non-error.
    fn observe_payload(&self, req: &RequestInfo, payload: &Value, header_applied: bool) {
        let trial = if header_applied {
            // The header already set the trial count for this response; a
            // stale body field must not overwrite it.
            None
        } else {
            gate::lookup(payload, TRIAL_FIELDS).and_then(gate::credit_value)
        };
        let real = gate::lookup(payload, REAL_FIELDS).and_then(gate::credit_value);
        self.state.merge_observed(trial, real);

        let signal = gate::normalize(payload);
        if signal.kind_absent_or_error() {
            if let Some(decision) = gate::classify(&signal) {
                self.raise_gate(req, decision);
            }
        }
    }
}

impl NetworkObserver for MonitorObserver {
    fn before_request(&self, req: &RequestInfo) {
        if self.qualifies_for_refresh(req) {
            self.spawn_refresh("pre");
        }
    }

    fn after_response(&self, req: &RequestInfo, resp: &ApiResponse) {
        let header_trial = trial_from_headers(&resp.headers);
        if let Some(trial) = header_trial {
            self.state.set_trial(trial);
        }

        if resp.status == StatusCode::PAYMENT_REQUIRED {
            match resp.json::<Value>() {
                Ok(payload) => {
                    if let Some(decision) = gate::classify_payload(&payload) {
                        self.raise_gate(req, decision);
                    }
                }
                // A 402 whose body cannot be read still means the plan ran
                // out; gate with the subscription defaults.
                Err(_) => self.raise_gate(req, GateDecision::subscription_required()),
            }
        } else {
            let content_type = resp.content_type();
            if content_type.contains("json") {
                if let Ok(payload) = resp.json::<Value>() {
                    self.observe_payload(req, &payload, header_trial.is_some());
                }
            } else if resp.status.as_u16() >= 400 && !content_type.contains("text/event-stream") {
                // Some proxies mislabel JSON error bodies as text. Try the
                // parse anyway; event streams are skipped because a partial
                // stream never holds a complete envelope.
                if let Ok(payload) = resp.json::<Value>() {
                    if let Some(decision) = gate::classify_payload(&payload) {
                        self.raise_gate(req, decision);
                    }
                }
            }
        }

        if self.qualifies_for_refresh(req) {
            self.spawn_refresh("post");
        }
    }
}

/// Fetches the credits endpoint and stores the result. All failures are
/// logged and swallowed; the previous snapshot stays in place.
async fn refresh_balance(client: &ApiClient, state: &MonitorState) {
    let path = client.config().credits_path.clone();
    let resp = match client.get(&path).await {
        Ok(resp) => resp,
        Err(err) => {
            debug!("credits refresh failed: {err}");
            return;
        }
    };
    if !resp.is_success() {
        debug!("credits refresh got {}", resp.status);
        return;
    }
    let payload: Value = match resp.json() {
        Ok(payload) => payload,
        Err(err) => {
            debug!("credits refresh body unreadable: {err}");
            return;
        }
    };
    // A successful fetch is authoritative: absent fields mean zero.
    let trial = gate::lookup(&payload, &["trial_remaining"])
        .and_then(gate::credit_value)
        .unwrap_or(0);
    let real = gate::lookup(&payload, &["real_remaining"])
        .and_then(gate::credit_value)
        .unwrap_or(0);
    state.set_balance(trial, real);
    debug!("credits refreshed: trial={trial} real={real}");
}

fn trial_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(TRIAL_CREDITS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Owns the monitor's state and its observer registration on a client.
///
/// ```no_run
/// # async fn demo() {
/// use std::sync::Arc;
/// use copyforge::config::Config;
/// use copyforge::credits::CreditsMonitor;
/// use copyforge::http::ApiClient;
///
/// let client = Arc::new(ApiClient::new(Config::from_env()).unwrap());
/// let monitor = CreditsMonitor::new(Arc::clone(&client));
/// monitor.start().await;
/// println!("{:?}", monitor.credits());
/// # }
/// ```
pub struct CreditsMonitor {
    client: Arc<ApiClient>,
    state: Arc<MonitorState>,
    observer: Arc<MonitorObserver>,
}

impl CreditsMonitor {
    pub fn new(client: Arc<ApiClient>) -> Self {
        let state = Arc::new(MonitorState::default());
        let observer = Arc::new(MonitorObserver {
            client: Arc::downgrade(&client),
            state: Arc::clone(&state),
            credits_path: client.config().credits_path.clone(),
        });
        Self {
            client,
            state,
            observer,
        }
    }

    /// Installs the observer on the client. Safe to call repeatedly: if an
    /// observer is already installed this does nothing, so traffic is never
    /// double-counted.
    pub fn activate(&self) {
        if !self.client.install_observer(self.observer.clone() as Arc<dyn NetworkObserver>) {
            debug!("monitor already active, leaving existing observer in place");
        }
    }

    /// Uninstalls the observer. No-op when nothing is installed.
    pub fn deactivate(&self) {
        self.client.remove_observer();
    }

    pub fn is_active(&self) -> bool {
        self.client.observer_installed()
    }

    /// Activates the monitor and, when a session token is present, performs
    /// the initial balance fetch. Without a token the fetch is skipped: the
    /// endpoint would only answer 401.
    pub async fn start(&self) {
        self.activate();
        if self.client.auth().has_token() {
            self.fetch_credits().await;
        } else {
            debug!("no session token, skipping initial credits fetch");
        }
    }

    /// Explicit, awaited balance refresh.
    pub async fn fetch_credits(&self) {
        refresh_balance(&self.client, &self.state).await;
    }

    /// Current credit snapshot.
    pub fn credits(&self) -> CreditBalance {
        *self.state.credits.read()
    }

    /// Current gate state.
    pub fn gate(&self) -> GateState {
        self.state.gate.read().clone()
    }

    /// Shows or hides the gate without touching its title or message. Used
    /// by frontends to dismiss the paywall or re-open the last one.
    pub fn set_gate_visible(&self, visible: bool) {
        self.state.set_gate_visible(visible);
    }
}
