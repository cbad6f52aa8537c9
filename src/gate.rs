use serde_json::Value;

// The backend signals "must upgrade" inconsistently across endpoints: some
// respond 402, some embed code/status_code/type fields in a 200 body, and
// the envelope may or may not wrap everything under `data`. This module
// flattens all of those shapes into one GatingSignal and classifies it.

pub const TITLE_TRIAL_EXHAUSTED: &str = "Free trial exhausted";
pub const TITLE_SUBSCRIPTION_REQUIRED: &str = "Subscription required";

pub const DEFAULT_TRIAL_MESSAGE: &str =
    "Your free trial credits are used up. Upgrade to keep generating.";
pub const DEFAULT_SUBSCRIPTION_MESSAGE: &str =
    "An active subscription is required to continue. Please upgrade your plan.";

pub const CODE_TRIAL_EXHAUSTED: &str = "trial_exhausted";
pub const CODE_SUBSCRIPTION_REQUIRED: &str = "subscription_required";

// Legacy envelopes mark errors as status_code 2 even on HTTP 200.
const GATING_STATUS_CODE: i64 = 2;

/// Flattened view of the fields a gating decision depends on, regardless of
/// where the payload put them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatingSignal {
    /// `code` or `error_code`, top level or under `data`.
    pub code: Option<String>,
    pub message: Option<String>,
    /// `status_code`, accepting integers and integer strings.
    pub status_code: Option<i64>,
    /// The payload's `type` field (`type` is a keyword, hence the name).
    pub kind: Option<String>,
}

impl GatingSignal {
    /// True when the payload's `type` is missing or the literal `"error"`.
    /// Payloads that declare any other type are business successes and are
    /// never run through gating.
    pub fn kind_absent_or_error(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k == "error")
    }

    fn message_or(&self, default: &str) -> String {
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => default.to_string(),
        }
    }
}

/// What the UI should show when a response gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub title: &'static str,
    pub message: String,
}

impl GateDecision {
    /// The fallback decision for a 402 whose body could not be read.
    pub fn subscription_required() -> Self {
        Self {
            title: TITLE_SUBSCRIPTION_REQUIRED,
            message: DEFAULT_SUBSCRIPTION_MESSAGE.to_string(),
        }
    }
}

// Field lookup tolerating one level of `data` wrapping; earlier names and
// the outer level win.
pub(crate) fn lookup<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| payload.get(n))
        .or_else(|| {
            let data = payload.get("data")?;
            names.iter().find_map(|n| data.get(n))
        })
}

/// Parse a credit count. Accepts non-negative JSON integers and strings
/// holding one; everything else (floats, negatives, prose) is discarded.
pub(crate) fn credit_value(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn int_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Flatten an arbitrary response payload into the fields gating cares about.
pub fn normalize(payload: &Value) -> GatingSignal {
    GatingSignal {
        code: lookup(payload, &["code", "error_code"])
            .and_then(Value::as_str)
            .map(str::to_string),
        message: lookup(payload, &["message"])
            .and_then(Value::as_str)
            .map(str::to_string),
        status_code: lookup(payload, &["status_code"]).and_then(int_value),
        kind: lookup(payload, &["type"])
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Decide whether a signal gates, and with what title/message.
///
/// Rules in priority order: explicit codes first, then the legacy
/// status_code heuristic (status_code 2 with type absent or "error", title
/// picked by a case-insensitive "trial" test on the message). Anything else
/// is not a gate and the user is not interrupted.
pub fn classify(signal: &GatingSignal) -> Option<GateDecision> {
    match signal.code.as_deref() {
        Some(CODE_TRIAL_EXHAUSTED) => {
            return Some(GateDecision {
                title: TITLE_TRIAL_EXHAUSTED,
                message: signal.message_or(DEFAULT_TRIAL_MESSAGE),
            });
        }
        Some(CODE_SUBSCRIPTION_REQUIRED) => {
            return Some(GateDecision {
                title: TITLE_SUBSCRIPTION_REQUIRED,
                message: signal.message_or(DEFAULT_SUBSCRIPTION_MESSAGE),
            });
        }
        _ => {}
    }

    if signal.status_code == Some(GATING_STATUS_CODE) && signal.kind_absent_or_error() {
        let mentions_trial = signal
            .message
            .as_deref()
            .map(|m| m.to_lowercase().contains("trial"))
            .unwrap_or(false);
        let decision = if mentions_trial {
            GateDecision {
                title: TITLE_TRIAL_EXHAUSTED,
                message: signal.message_or(DEFAULT_TRIAL_MESSAGE),
            }
        } else {
            GateDecision {
                title: TITLE_SUBSCRIPTION_REQUIRED,
                message: signal.message_or(DEFAULT_SUBSCRIPTION_MESSAGE),
            }
        };
        return Some(decision);
    }

    None
}

/// Convenience for callers holding a raw payload.
pub fn classify_payload(payload: &Value) -> Option<GateDecision> {
    classify(&normalize(payload))
}
