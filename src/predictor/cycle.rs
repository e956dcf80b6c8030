//! Cycle-average consumption model for a single (user, product).
//!
//! A cycle opens on a purchase and closes on the next EMPTY (or a purchase
//! while LOW). Completed cycle lengths feed a cumulative average of
//! `cycle_mean_days`; a purchase while still FULL/MEDIUM censors the cycle
//! instead. Pure state transitions, no I/O.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Forecast, InventoryState};
use crate::predictor::config::PredictorConfig;
use crate::predictor::events::{parse_utc_timestamp, FeedbackEvent, PurchaseEvent, WasteReason};

/// MAD never collapses below this.
pub const MAD_FLOOR: f64 = 0.1;

/// Guard for divisions by mean or multiplier.
pub const EPS: f64 = 1e-6;

/// Ratio of days_left / mean below which the product counts as empty.
const EMPTY_RATIO_CUTOFF: f64 = 0.02;

/// Per-product predictor state, persisted as params JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleState {
    pub cycle_mean_days: f64,
    pub cycle_mad_days: f64,

    /// Opening purchase of the current cycle; `None` means no active cycle.
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub last_purchase_at: Option<DateTime<Utc>>,
    pub last_update_at: DateTime<Utc>,
    pub last_feedback_at: Option<DateTime<Utc>>,
    /// Set by an EMPTY feedback, consumed by the next purchase.
    pub empty_at: Option<DateTime<Utc>>,

    pub last_pred_days_left: Option<f64>,

    pub n_strong_updates: u32,
    pub n_total_updates: u32,
    pub n_completed_cycles: u32,
    pub censored_cycles: u32,
    pub waste_events: u32,

    pub category_id: Option<Uuid>,
}

fn days_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_seconds().abs() as f64 / 86_400.0
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Map days-left onto the coarse stock level.
pub fn derive_state(days_left: f64, mean_days: f64, cfg: &PredictorConfig) -> InventoryState {
    if days_left <= 0.0 {
        return InventoryState::Empty;
    }
    let ratio = days_left / mean_days.max(EPS);
    if ratio < EMPTY_RATIO_CUTOFF {
        InventoryState::Empty
    } else if ratio >= cfg.full_ratio {
        InventoryState::Full
    } else if ratio >= cfg.medium_ratio {
        InventoryState::Medium
    } else {
        InventoryState::Low
    }
}

impl CycleState {
    /// Cold-start state seeded from the category prior.
    pub fn init_from_category(
        category_id: Option<Uuid>,
        cfg: &PredictorConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let prior = cfg.prior_for(category_id);
        Self {
            cycle_mean_days: prior
                .mean_days
                .clamp(cfg.min_cycle_days, cfg.max_cycle_days),
            cycle_mad_days: prior.mad_days.max(MAD_FLOOR),
            cycle_started_at: None,
            last_purchase_at: None,
            last_update_at: now,
            last_feedback_at: None,
            empty_at: None,
            last_pred_days_left: None,
            n_strong_updates: 0,
            n_total_updates: 0,
            n_completed_cycles: 0,
            censored_cycles: 0,
            waste_events: 0,
            category_id,
        }
    }

    /// Open a new cycle, first settling the previous one.
    ///
    /// `current_state` is the coarse inventory level captured *before* the
    /// purchase mutated the inventory row; it decides whether a still-open
    /// cycle counts as completed (LOW) or censored (FULL/MEDIUM).
    pub fn apply_purchase(
        &mut self,
        ev: &PurchaseEvent,
        cfg: &PredictorConfig,
        current_state: Option<InventoryState>,
    ) {
        match (self.empty_at, self.cycle_started_at) {
            (Some(empty_at), Some(started)) => {
                let observed =
                    days_between(empty_at, started).clamp(cfg.min_cycle_days, cfg.max_cycle_days);
                self.record_completed_cycle(observed, cfg);
            }
            (None, Some(started)) if current_state == Some(InventoryState::Low) => {
                // Repurchase while running low closes the cycle here.
                let observed =
                    days_between(ev.ts, started).clamp(cfg.min_cycle_days, cfg.max_cycle_days);
                self.record_completed_cycle(observed, cfg);
            }
            (_, Some(_))
                if matches!(
                    current_state,
                    Some(InventoryState::Full | InventoryState::Medium)
                ) =>
            {
                self.censored_cycles += 1;
            }
            _ => {}
        }

        self.cycle_started_at = Some(ev.ts);
        self.last_purchase_at = Some(ev.ts);
        self.last_update_at = ev.ts;
        self.empty_at = None;
    }

    /// Cumulative-average update over all completed cycles.
    fn record_completed_cycle(&mut self, observed: f64, cfg: &PredictorConfig) {
        let k = self.n_completed_cycles as f64;
        let old_mean = self.cycle_mean_days;

        if self.n_completed_cycles == 0 {
            self.cycle_mean_days = observed;
            self.cycle_mad_days = (observed - old_mean).abs().max(MAD_FLOOR);
        } else {
            self.cycle_mean_days = (old_mean * k + observed) / (k + 1.0);
            self.cycle_mad_days =
                (self.cycle_mad_days * k + (observed - old_mean).abs()) / (k + 1.0);
        }
        self.cycle_mean_days = self
            .cycle_mean_days
            .clamp(cfg.min_cycle_days, cfg.max_cycle_days);
        self.cycle_mad_days = self.cycle_mad_days.clamp(MAD_FLOOR, cfg.max_cycle_days);

        self.n_completed_cycles += 1;
        self.n_strong_updates += 1;
    }

    pub fn apply_feedback(&mut self, ev: &FeedbackEvent, cfg: &PredictorConfig) {
        use crate::models::FeedbackKind;

        match ev.kind {
            FeedbackKind::Empty => {
                // Keep cycle_started_at: the next purchase measures the cycle.
                if self.empty_at.is_none() {
                    self.empty_at = Some(ev.ts);
                }
            }
            FeedbackKind::Wasted => {
                self.waste_events += 1;
                match WasteReason::classify(ev.note.as_deref()) {
                    WasteReason::RanOut => {
                        if let Some(started) = self.cycle_started_at {
                            let observed = days_between(ev.ts, started)
                                .clamp(cfg.min_cycle_days, cfg.max_cycle_days);
                            let a = 0.2 * cfg.alpha_strong;
                            let old_mean = self.cycle_mean_days;
                            self.cycle_mean_days = ((1.0 - a) * old_mean + a * observed)
                                .clamp(cfg.min_cycle_days, cfg.max_cycle_days);
                            self.cycle_mad_days = ((1.0 - a) * self.cycle_mad_days
                                + a * (observed - old_mean).abs())
                            .clamp(MAD_FLOOR, cfg.max_cycle_days);
                        } else {
                            self.cycle_mad_days =
                                (self.cycle_mad_days * 1.03).clamp(MAD_FLOOR, cfg.max_cycle_days);
                        }
                        self.cycle_started_at = None;
                    }
                    WasteReason::NotConsumed => {
                        // Thrown out for taste/expiry: not a real consumption
                        // cycle, only widen the uncertainty.
                        self.cycle_started_at = None;
                        self.cycle_mad_days =
                            (self.cycle_mad_days * 1.03).clamp(MAD_FLOOR, cfg.max_cycle_days);
                    }
                }
            }
            FeedbackKind::Exact => {
                self.cycle_mad_days = ((1.0 - cfg.alpha_confirm) * self.cycle_mad_days)
                    .clamp(MAD_FLOOR, cfg.max_cycle_days);
            }
            FeedbackKind::More | FeedbackKind::Less => {
                // The immediate days_left adjustment happens at the API layer;
                // the mean moves only through observed cycles.
                self.last_feedback_at = Some(ev.ts);
            }
        }

        self.last_update_at = ev.ts;
        self.n_total_updates += 1;
    }

    /// Days of supply left, habit-adjusted.
    ///
    /// `inventory_days_left` overrides the elapsed-time derivation when the
    /// caller holds a fresher cached value (refresh paths).
    pub fn compute_days_left(
        &self,
        now: DateTime<Utc>,
        multiplier: f64,
        inventory_days_left: Option<f64>,
    ) -> f64 {
        let mult = multiplier.max(EPS);
        if let Some(days) = inventory_days_left {
            return (days / mult).max(0.0);
        }
        let Some(started) = self.cycle_started_at else {
            return 0.0;
        };
        let base = (self.cycle_mean_days - days_between(now, started)).max(0.0);
        (base / mult).max(0.0)
    }

    /// Scalar confidence in [0, 1]: evidence count x MAD stability x recency.
    pub fn compute_confidence(&self, now: DateTime<Utc>, cfg: &PredictorConfig) -> f64 {
        let k = if self.n_completed_cycles > 0 {
            self.n_completed_cycles
        } else {
            self.n_strong_updates
        };

        let (evidence, stability) = if k == 0 {
            // No observations yet: the MAD is a prior, not instability.
            (0.3, 1.0)
        } else {
            let evidence = sigmoid(k as f64 / 2.0);
            let stability = (1.0 - self.cycle_mad_days / self.cycle_mean_days.max(1.0))
                .clamp(0.2, 1.0);
            (evidence, stability)
        };

        let days_since = days_between(now, self.last_update_at);
        let recency = (-days_since / cfg.recency_tau_days.max(EPS)).exp().max(0.1);

        (0.2 + 0.8 * evidence * stability * recency).clamp(0.0, 1.0)
    }

    pub fn predict(
        &self,
        now: DateTime<Utc>,
        multiplier: f64,
        cfg: &PredictorConfig,
        inventory_days_left: Option<f64>,
    ) -> Forecast {
        let days_left = self.compute_days_left(now, multiplier, inventory_days_left);
        Forecast {
            expected_days_left: days_left,
            predicted_state: derive_state(days_left, self.cycle_mean_days, cfg),
            confidence: self.compute_confidence(now, cfg),
            generated_at: now,
        }
    }

    pub fn stamp_last_prediction(&mut self, forecast: &Forecast) {
        self.last_pred_days_left = Some(forecast.expected_days_left);
    }

    /// Serialize to the stable params layout.
    pub fn to_params_json(&self) -> Value {
        serde_json::json!({
            "cycle_mean_days": self.cycle_mean_days,
            "cycle_mad_days": self.cycle_mad_days,
            "cycle_started_at": self.cycle_started_at.map(|t| t.to_rfc3339()),
            "last_purchase_at": self.last_purchase_at.map(|t| t.to_rfc3339()),
            "last_update_at": self.last_update_at.to_rfc3339(),
            "last_feedback_at": self.last_feedback_at.map(|t| t.to_rfc3339()),
            "empty_at": self.empty_at.map(|t| t.to_rfc3339()),
            "last_pred_days_left": self.last_pred_days_left,
            "n_strong_updates": self.n_strong_updates,
            "n_total_updates": self.n_total_updates,
            "n_completed_cycles": self.n_completed_cycles,
            "censored_cycles": self.censored_cycles,
            "waste_events": self.waste_events,
            "category_id": self.category_id,
        })
    }

    /// Deserialize from params JSON, tolerating missing keys (backfilled with
    /// defaults) and ignoring unknown ones. Returns `None` when the payload
    /// is not an object at all.
    pub fn from_params_json(params: &Value, now: DateTime<Utc>) -> Option<Self> {
        let obj = params.as_object()?;

        let f64_of = |key: &str, default: f64| -> f64 {
            obj.get(key).and_then(Value::as_f64).unwrap_or(default)
        };
        let u32_of = |key: &str| -> u32 {
            obj.get(key).and_then(Value::as_u64).unwrap_or(0) as u32
        };
        let ts_of = |key: &str| -> Option<DateTime<Utc>> {
            obj.get(key)
                .and_then(Value::as_str)
                .and_then(|s| parse_utc_timestamp(s).ok())
        };

        Some(Self {
            cycle_mean_days: f64_of("cycle_mean_days", 7.0),
            cycle_mad_days: f64_of("cycle_mad_days", 2.0),
            cycle_started_at: ts_of("cycle_started_at"),
            last_purchase_at: ts_of("last_purchase_at"),
            last_update_at: ts_of("last_update_at").unwrap_or(now),
            last_feedback_at: ts_of("last_feedback_at"),
            empty_at: ts_of("empty_at"),
            last_pred_days_left: obj.get("last_pred_days_left").and_then(Value::as_f64),
            n_strong_updates: u32_of("n_strong_updates"),
            n_total_updates: u32_of("n_total_updates"),
            n_completed_cycles: u32_of("n_completed_cycles"),
            censored_cycles: u32_of("censored_cycles"),
            waste_events: u32_of("waste_events"),
            category_id: obj
                .get("category_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
        })
    }
}
