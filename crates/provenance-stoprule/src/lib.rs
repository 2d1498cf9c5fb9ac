//! The StopRule controller: the single uniform surface every invariant
//! violation in the workspace goes through.
//!
//! A violation always emits an `anomaly` receipt. If its action is `halt`,
//! a following `halt` receipt is emitted and the caller receives a typed
//! [`HaltingError`] carrying both receipts — never a silent swallow.

#![deny(missing_docs)]

use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use thiserror::Error;
use tracing::{info, warn};

use provenance_spec::{emit, EnvelopeError, Receipt, ReceiptType, Tenant, TypeRegistry};

/// How an invariant breach is categorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// A small, likely-benign deviation.
    Drift,
    /// A sustained deviation that is not yet a hard breach.
    Degradation,
    /// A hard breach of a stated invariant.
    Violation,
    /// A large relative deviation from baseline that has not been confirmed
    /// as a rule breach.
    Deviation,
    /// An explicit rule-breach flag raised by the caller, independent of magnitude.
    AntiPattern,
}

/// What the controller does in response to a classified breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Record and continue.
    Alert,
    /// Record and notify an operator, but do not halt.
    Escalate,
    /// Record, notify, and stop the offending operation.
    Halt,
    /// Record and apply an automatic remediation.
    AutoFix,
}

/// Default relative-deviation thresholds the magnitude heuristic uses when
/// the caller does not supply an explicit classification.
pub const DEGRADATION_THRESHOLD: f64 = 0.1;
/// Above this relative deviation, a breach classifies as `deviation`.
pub const DEVIATION_THRESHOLD: f64 = 0.5;

/// Default escalation window between a halt receipt and its deadline.
pub fn default_escalation_window() -> Duration {
    Duration::hours(4)
}

/// Derive a `(classification, action)` pair from the magnitude of `delta`
/// relative to `baseline`, mirroring the source's threshold-based
/// auto-classifier: a large relative deviation escalates for operator
/// review but never halts on magnitude alone. An explicit `anti_pattern`
/// flag wins over magnitude and also only escalates — `violation`/`halt`
/// is never derived by this heuristic, only set explicitly via
/// [`Breach::with_verdict`] by a caller that has confirmed a rule breach.
pub fn classify(delta: f64, baseline: f64, anti_pattern: bool) -> (Classification, Action) {
    if anti_pattern {
        return (Classification::AntiPattern, Action::Escalate);
    }
    let relative = if baseline.abs() > f64::EPSILON {
        (delta / baseline).abs()
    } else {
        delta.abs()
    };
    if relative > DEVIATION_THRESHOLD {
        (Classification::Deviation, Action::Escalate)
    } else if relative > DEGRADATION_THRESHOLD {
        (Classification::Degradation, Action::Alert)
    } else {
        (Classification::Drift, Action::AutoFix)
    }
}

/// A halted operation: the caller receives both receipts the controller
/// emitted and must not discard them silently.
#[derive(Debug, Clone, Error)]
#[error("halted on metric `{metric}`: {reason}")]
pub struct HaltingError {
    /// The invariant or metric that triggered the halt.
    pub metric: String,
    /// Human-readable reason recorded on the halt receipt.
    pub reason: String,
    /// The anomaly receipt that classified the breach.
    pub anomaly: Receipt,
    /// The halt receipt that followed it.
    pub halt: Receipt,
}

/// Inputs describing a detected breach.
pub struct Breach {
    /// Name of the invariant or metric being checked (e.g. `"claim_coverage"`).
    pub metric: String,
    /// Expected value.
    pub baseline: f64,
    /// Observed value.
    pub observed: f64,
    /// Tenant the breach is scoped to.
    pub tenant: Option<Tenant>,
    /// Explicit classification, overriding the magnitude heuristic.
    pub classification: Option<Classification>,
    /// Explicit action, overriding the classification's default action.
    pub action: Option<Action>,
    /// Whether the caller detected an explicit rule-breach / anti-pattern condition.
    pub anti_pattern: bool,
    /// Human-readable halt reason, used only when the resolved action is `halt`.
    pub halt_reason: Option<String>,
}

impl Breach {
    /// A breach described only by its observed-vs-baseline numbers; classification
    /// and action are derived by [`classify`].
    pub fn new(metric: impl Into<String>, baseline: f64, observed: f64) -> Self {
        Breach {
            metric: metric.into(),
            baseline,
            observed,
            tenant: None,
            classification: None,
            action: None,
            anti_pattern: false,
            halt_reason: None,
        }
    }

    /// Scope the breach to a tenant.
    pub fn with_tenant(mut self, tenant: impl Into<Tenant>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Force a classification and action rather than deriving them from magnitude.
    pub fn with_verdict(mut self, classification: Classification, action: Action) -> Self {
        self.classification = Some(classification);
        self.action = Some(action);
        self
    }

    /// Mark this breach as an explicit anti-pattern / rule-breach condition.
    pub fn anti_pattern(mut self) -> Self {
        self.anti_pattern = true;
        self
    }

    /// Attach a human-readable reason used on the halt receipt, if one is emitted.
    pub fn with_halt_reason(mut self, reason: impl Into<String>) -> Self {
        self.halt_reason = Some(reason.into());
        self
    }
}

fn default_registry() -> TypeRegistry {
    // `anomaly` and `halt` are built-in tags; any registry recognizes them.
    TypeRegistry::new()
}

/// Raise a breach through the StopRule controller.
///
/// Always emits an `anomaly` receipt. When the resolved action is `halt`,
/// also emits a `halt` receipt and returns `Err(HaltingError)` carrying
/// both receipts. Otherwise returns `Ok(anomaly_receipt)`.
pub fn raise(breach: Breach) -> Result<Receipt, HaltingError> {
    let (derived_classification, derived_action) =
        classify(breach.observed - breach.baseline, breach.baseline, breach.anti_pattern);
    let classification = breach.classification.unwrap_or(derived_classification);
    let action = breach.action.unwrap_or(derived_action);
    let delta = breach.observed - breach.baseline;
    let registry = default_registry();

    let anomaly_payload: Map<String, serde_json::Value> = [
        ("metric".to_string(), json!(breach.metric)),
        ("baseline".to_string(), json!(breach.baseline)),
        ("delta".to_string(), json!(delta)),
        ("classification".to_string(), json!(classification)),
        ("action".to_string(), json!(action)),
    ]
    .into_iter()
    .collect();

    let anomaly = emit(
        ReceiptType::Anomaly,
        anomaly_payload,
        breach.tenant.clone(),
        &registry,
    )
    .expect("anomaly payload never collides with reserved fields");

    if !matches!(action, Action::Halt) {
        info!(metric = %breach.metric, ?classification, ?action, "anomaly recorded");
        return Ok(anomaly);
    }

    let reason = breach
        .halt_reason
        .unwrap_or_else(|| format!("invariant breach on metric `{}`", breach.metric));
    let deadline = (Utc::now() + default_escalation_window()).to_rfc3339_opts(SecondsFormat::Millis, true);
    let halt_payload: Map<String, serde_json::Value> = [
        ("reason".to_string(), json!(reason)),
        ("escalation_deadline".to_string(), json!(deadline)),
        ("anomaly_digest".to_string(), json!(anomaly.payload_hash.as_str())),
    ]
    .into_iter()
    .collect();
    let halt = emit(ReceiptType::Halt, halt_payload, breach.tenant, &registry)
        .expect("halt payload never collides with reserved fields");

    warn!(metric = %breach.metric, %reason, "operation halted");
    Err(HaltingError {
        metric: anomaly
            .payload
            .get("metric")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        reason,
        anomaly,
        halt,
    })
}

/// Convenience wrapper for wrapping a collaborator-level EnvelopeError as an
/// unrecoverable violation, used by components that need to surface a
/// registration failure through the same halting discipline.
pub fn raise_from_envelope_error(metric: &str, err: EnvelopeError) -> HaltingError {
    let breach = Breach::new(metric, 0.0, 1.0)
        .with_verdict(Classification::Violation, Action::Halt)
        .with_halt_reason(err.to_string());
    raise(breach).expect_err("a Halt-verdict breach always returns Err")
}
