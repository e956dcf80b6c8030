//! Predictor service: the event dispatcher, the refresh engine, the habit
//! refresh protocol, and the immediate MORE/LESS adjustment.
//!
//! Every write path goes repository -> core -> repository. Single-product
//! failures inside sweeps are logged and isolated; the log row stays put so
//! a dispatch can be retried. Callers must schedule each log id at most
//! once: closing a cycle twice would double-count the observation.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::PantryError;
use crate::habits::{affected_products, contributed_multiplier, resolve_multiplier};
use crate::models::{
    FeedbackKind, Habit, HabitEffects, HabitStatus, InventoryAction, InventoryLogRow,
    InventorySource, InventoryState, NewLogEntry,
};
use crate::predictor::config::PredictorConfig;
use crate::predictor::cycle::{derive_state, CycleState};
use crate::predictor::events::{classify_log_row, FeedbackEvent};
use crate::storage::PantryRepository;

/// Result of an immediate MORE/LESS adjustment.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackOutcome {
    pub log_id: Uuid,
    pub days_left: f64,
    pub state: InventoryState,
    pub confidence: f64,
}

/// Log rows produced by a product action, plus the coarse state captured
/// before the action mutated the inventory row.
#[derive(Debug, Clone)]
pub struct ProductActionOutcome {
    pub log: InventoryLogRow,
    pub state_before: InventoryState,
}

pub struct PredictorService {
    repo: Arc<dyn PantryRepository>,
    clock: Arc<dyn Clock>,
}

impl PredictorService {
    pub fn new(repo: Arc<dyn PantryRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn load_cfg_and_profile(&self, user_id: Uuid) -> Result<(Uuid, PredictorConfig), PantryError> {
        let profile = self.repo.get_active_profile(user_id)?;
        let cfg = PredictorConfig::from_profile_json(&profile.config);
        Ok((profile.profile_id, cfg))
    }

    /// Load the predictor state for (user, product), initializing from the
    /// category prior on first read or when the stored params are malformed.
    fn ensure_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        cfg: &PredictorConfig,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<CycleState, PantryError> {
        let Some(row) = self.repo.get_predictor_state(user_id, product_id)? else {
            return Ok(CycleState::init_from_category(category_id, cfg, now));
        };

        let mut state = match CycleState::from_params_json(&row.params, now) {
            Some(state) => state,
            None => {
                warn!(
                    "malformed predictor state for product {}, reinitializing from prior",
                    product_id
                );
                CycleState::init_from_category(category_id, cfg, now)
            }
        };
        if state.category_id.is_none() {
            state.category_id = category_id;
        }
        Ok(state)
    }

    fn category_of(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Uuid>, PantryError> {
        let products: HashMap<Uuid, Option<Uuid>> = self
            .repo
            .get_user_inventory_products(user_id)?
            .into_iter()
            .collect();
        Ok(products.get(&product_id).copied().flatten())
    }

    /// Multiplier from all active habits; store failures degrade to 1.0.
    pub fn habit_multiplier(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> f64 {
        match self.repo.get_active_habit_effects(user_id, now) {
            Ok(effects) => resolve_multiplier(&effects, product_id, category_id),
            Err(e) => {
                warn!("could not fetch habits for multiplier, using 1.0: {}", e);
                1.0
            }
        }
    }

    fn persist(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        profile_id: Uuid,
        state: &CycleState,
        forecast: &crate::models::Forecast,
        source: InventorySource,
        trigger_log_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), PantryError> {
        self.repo.upsert_predictor_state(
            user_id,
            product_id,
            profile_id,
            &state.to_params_json(),
            forecast.confidence,
            now,
        )?;
        self.repo.upsert_inventory_days_estimate(
            user_id,
            product_id,
            forecast.expected_days_left,
            forecast.predicted_state,
            forecast.confidence,
            source,
            None,
        )?;
        self.repo
            .insert_forecast(user_id, product_id, forecast, trigger_log_id)?;
        Ok(())
    }

    /// Dispatch one committed log row: classify, apply, forecast, persist.
    ///
    /// `state_before` is the coarse inventory state captured by a caller
    /// that already mutated the inventory row; when absent it is read from
    /// the store.
    pub fn process_inventory_log(
        &self,
        log_id: Uuid,
        state_before: Option<InventoryState>,
    ) -> Result<(), PantryError> {
        let now = self.clock.now();
        let row = self
            .repo
            .get_inventory_log_row(log_id)?
            .ok_or(PantryError::MissingLogRow(log_id))?;

        let (profile_id, cfg) = self.load_cfg_and_profile(row.user_id)?;
        let category_id = self.category_of(row.user_id, row.product_id)?;
        let mut state =
            self.ensure_state(row.user_id, row.product_id, &cfg, category_id, now)?;

        let (purchase_ev, feedback_ev) = classify_log_row(&row);
        let is_purchase = purchase_ev.is_some();

        if let Some(ev) = &purchase_ev {
            let pre_state = match state_before {
                Some(state) => Some(state),
                None => self
                    .repo
                    .get_current_inventory_state(row.user_id, row.product_id)?,
            };
            state.apply_purchase(ev, &cfg, pre_state);
        }
        if let Some(ev) = &feedback_ev {
            state.apply_feedback(ev, &cfg);
        }

        // Purchases forecast with multiplier 1.0: active habits already
        // shaped cycle_mean_days through the refresh protocol, and applying
        // them again here would double-count.
        let multiplier = if is_purchase {
            1.0
        } else {
            self.habit_multiplier(row.user_id, row.product_id, category_id, now)
        };

        let forecast = state.predict(now, multiplier, &cfg, None);
        state.stamp_last_prediction(&forecast);

        self.persist(
            row.user_id,
            row.product_id,
            profile_id,
            &state,
            &forecast,
            InventorySource::System,
            Some(log_id),
            now,
        )?;

        debug!(
            "processed log {} for product {}: {:.2} days left ({})",
            log_id,
            row.product_id,
            forecast.expected_days_left,
            forecast.predicted_state.as_str()
        );
        Ok(())
    }

    /// Recompute forecasts for every product in the user's inventory.
    ///
    /// Habits are applied to the cached `last_pred_days_left` rather than
    /// re-derived from the mean, so the latest adjusted value carries over.
    pub fn refresh_user(&self, user_id: Uuid) -> Result<(), PantryError> {
        let now = self.clock.now();
        let (profile_id, cfg) = self.load_cfg_and_profile(user_id)?;

        for (product_id, category_id) in self.repo.get_user_inventory_products(user_id)? {
            if let Err(e) =
                self.refresh_one(user_id, product_id, category_id, profile_id, &cfg, now)
            {
                warn!("refresh failed for product {}: {}", product_id, e);
            }
        }
        Ok(())
    }

    fn refresh_one(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        category_id: Option<Uuid>,
        profile_id: Uuid,
        cfg: &PredictorConfig,
        now: DateTime<Utc>,
    ) -> Result<(), PantryError> {
        let mut state = self.ensure_state(user_id, product_id, cfg, category_id, now)?;
        let multiplier = self.habit_multiplier(user_id, product_id, category_id, now);

        let forecast = state.predict(now, multiplier, cfg, state.last_pred_days_left);
        state.stamp_last_prediction(&forecast);

        self.persist(
            user_id,
            product_id,
            profile_id,
            &state,
            &forecast,
            InventorySource::System,
            None,
            now,
        )
    }

    /// Fold a habit's multipliers into the learned means of every product it
    /// touches. Creation divides, deletion multiplies, so create-then-delete
    /// round-trips (up to clamp saturation).
    pub fn refresh_products_affected_by_habit(
        &self,
        user_id: Uuid,
        effects_json: &serde_json::Value,
        is_deletion: bool,
    ) -> Result<(), PantryError> {
        let effects: HabitEffects = match serde_json::from_value(effects_json.clone()) {
            Ok(effects) => effects,
            Err(e) => {
                warn!("ignoring malformed habit effects during refresh: {}", e);
                return Ok(());
            }
        };
        if effects.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let (profile_id, cfg) = self.load_cfg_and_profile(user_id)?;
        let inventory = self.repo.get_user_inventory_products(user_id)?;

        for (product_id, category_id) in affected_products(&effects, &inventory) {
            if let Err(e) = self.apply_habit_change_to_product(
                user_id,
                product_id,
                category_id,
                &effects,
                is_deletion,
                profile_id,
                &cfg,
                now,
            ) {
                warn!(
                    "habit refresh failed for product {}: {}",
                    product_id, e
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_habit_change_to_product(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        category_id: Option<Uuid>,
        effects: &HabitEffects,
        is_deletion: bool,
        profile_id: Uuid,
        cfg: &PredictorConfig,
        now: DateTime<Utc>,
    ) -> Result<(), PantryError> {
        let habit_mult = contributed_multiplier(effects, product_id, category_id);
        let mut state = self.ensure_state(user_id, product_id, cfg, category_id, now)?;

        let fold = |v: f64| {
            if is_deletion {
                v * habit_mult
            } else {
                v / habit_mult
            }
        };
        state.cycle_mean_days = fold(state.cycle_mean_days)
            .clamp(cfg.min_cycle_days, cfg.max_cycle_days);
        state.last_pred_days_left = state.last_pred_days_left.map(fold);

        // Forecast with the full resolver multiplier over the cached value;
        // last_pred_days_left keeps the folded value so a later inverse
        // fold restores it.
        let multiplier = self.habit_multiplier(user_id, product_id, category_id, now);
        let forecast = state.predict(now, multiplier, cfg, state.last_pred_days_left);

        self.persist(
            user_id,
            product_id,
            profile_id,
            &state,
            &forecast,
            InventorySource::System,
            None,
            now,
        )
    }

    /// Store a habit and run the refresh protocol when it is active.
    pub fn create_habit(&self, habit: &Habit) -> Result<(), PantryError> {
        self.repo.insert_habit(habit)?;
        if habit.status == HabitStatus::Active {
            self.refresh_products_affected_by_habit(habit.user_id, &habit.effects, false)?;
        }
        info!("habit {} created for user {}", habit.habit_id, habit.user_id);
        Ok(())
    }

    /// Delete a habit and undo its multipliers if it was active.
    pub fn remove_habit(&self, user_id: Uuid, habit_id: Uuid) -> Result<bool, PantryError> {
        let Some((status, effects)) = self.repo.delete_habit(user_id, habit_id)? else {
            return Ok(false);
        };
        if status == HabitStatus::Active {
            self.refresh_products_affected_by_habit(user_id, &effects, true)?;
        }
        info!("habit {} deleted for user {}", habit_id, user_id);
        Ok(true)
    }

    /// Immediate MORE/LESS adjustment: scales the displayed days_left right
    /// away and records the feedback on the core state. The learned mean is
    /// only moved by observed cycles.
    pub fn apply_more_less_feedback(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        direction: &str,
    ) -> Result<FeedbackOutcome, PantryError> {
        let kind = match direction.to_lowercase().as_str() {
            "more" => FeedbackKind::More,
            "less" => FeedbackKind::Less,
            other => return Err(PantryError::InvalidFeedbackDirection(other.to_string())),
        };
        let more = kind == FeedbackKind::More;
        let now = self.clock.now();

        let current_state = self
            .repo
            .get_current_inventory_state(user_id, product_id)?
            .ok_or(PantryError::MissingInventoryItem(product_id))?;

        // Step the coarse ladder for the log entry (EMPTY < LOW < MEDIUM < FULL).
        let ladder = [
            InventoryState::Full,
            InventoryState::Medium,
            InventoryState::Low,
            InventoryState::Empty,
        ];
        let index = ladder
            .iter()
            .position(|s| *s == current_state)
            .unwrap_or(1);
        let delta_state = if more {
            ladder[index.saturating_sub(1)]
        } else {
            ladder[(index + 1).min(ladder.len() - 1)]
        };
        let note = if more {
            "User feedback: More stock needed"
        } else {
            "User feedback: Less stock needed"
        };

        let log = self.repo.append_inventory_log(
            &NewLogEntry {
                user_id,
                product_id,
                action: InventoryAction::Adjust,
                delta_state: Some(delta_state),
                action_confidence: 1.0,
                occurred_at: Some(now),
                source: InventorySource::Manual,
                note: Some(note.to_string()),
            },
            now,
        )?;

        let (profile_id, cfg) = self.load_cfg_and_profile(user_id)?;
        let category_id = self.category_of(user_id, product_id)?;
        let mut state = self.ensure_state(user_id, product_id, &cfg, category_id, now)?;

        state.apply_feedback(
            &FeedbackEvent {
                ts: now,
                kind,
                source: InventorySource::Manual,
                note: Some(note.to_string()),
            },
            &cfg,
        );

        let inventory_days_left = self.repo.get_current_inventory_days(user_id, product_id)?;
        let multiplier = self.habit_multiplier(user_id, product_id, category_id, now);
        let current_days_left = state.compute_days_left(now, multiplier, inventory_days_left);

        let is_empty = current_days_left <= 0.01 || current_state == InventoryState::Empty;
        let new_days_left = if is_empty {
            if more {
                // The user says they still have some: restart at a sliver of
                // the mean instead of a full cycle.
                state.empty_at = None;
                if state.cycle_mean_days > 0.0 {
                    state.cycle_mean_days * cfg.more_less_ratio
                } else {
                    1.5
                }
            } else {
                0.0
            }
        } else {
            let factor = if more {
                1.0 + cfg.more_less_ratio
            } else {
                1.0 - cfg.more_less_ratio
            };
            (current_days_left * factor).max(0.0)
        };

        let new_state = derive_state(new_days_left, state.cycle_mean_days, &cfg);
        state.last_pred_days_left = Some(new_days_left);
        let confidence = state.compute_confidence(now, &cfg);

        self.repo.upsert_predictor_state(
            user_id,
            product_id,
            profile_id,
            &state.to_params_json(),
            confidence,
            now,
        )?;
        self.repo.upsert_inventory_days_estimate(
            user_id,
            product_id,
            new_days_left,
            new_state,
            confidence,
            InventorySource::Manual,
            None,
        )?;

        info!(
            "{} feedback for product {}: days_left {:.2} -> {:.2} ({})",
            kind.as_str(),
            product_id,
            current_days_left,
            new_days_left,
            new_state.as_str()
        );

        Ok(FeedbackOutcome {
            log_id: log.log_id,
            days_left: new_days_left,
            state: new_state,
            confidence,
        })
    }

    /// Record a "thrown away" / "repurchased" / "ran out" action: append the
    /// log row, pre-capture the coarse state, and reflect the user's claim
    /// on the inventory row. Dispatching the returned log is the caller's
    /// (usually fire-and-forget) business.
    pub fn record_product_action(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        action_type: &str,
        reason: &str,
        custom_reason: Option<&str>,
    ) -> Result<ProductActionOutcome, PantryError> {
        let now = self.clock.now();

        let full_reason = match custom_reason.map(str::trim).filter(|s| !s.is_empty()) {
            Some(custom) => format!("{reason}: {custom}"),
            None => reason.to_string(),
        };

        let (action, note, delta_state) = match action_type.to_lowercase().as_str() {
            "thrown_away" => (
                InventoryAction::Trash,
                format!("WASTED: {full_reason}"),
                InventoryState::Empty,
            ),
            "ran_out" => (
                InventoryAction::Empty,
                format!("EMPTY: {full_reason}"),
                InventoryState::Empty,
            ),
            "repurchased" => (
                InventoryAction::Repurchase,
                format!("PURCHASE: {full_reason}"),
                InventoryState::Full,
            ),
            other => return Err(PantryError::UnknownAction(other.to_string())),
        };

        // Capture before any mutation: the dispatcher needs the state the
        // purchase found, not the one this action writes.
        let state_before = self
            .repo
            .get_current_inventory_state(user_id, product_id)?
            .ok_or(PantryError::MissingInventoryItem(product_id))?;

        let log = self.repo.append_inventory_log(
            &NewLogEntry {
                user_id,
                product_id,
                action,
                delta_state: Some(delta_state),
                action_confidence: 1.0,
                occurred_at: Some(now),
                source: InventorySource::Manual,
                note: Some(note),
            },
            now,
        )?;

        if delta_state == InventoryState::Empty {
            self.repo.upsert_inventory_days_estimate(
                user_id,
                product_id,
                0.0,
                InventoryState::Empty,
                1.0,
                InventorySource::Manual,
                None,
            )?;
        }

        Ok(ProductActionOutcome { log, state_before })
    }

    /// Record a product action and dispatch it inline. Dispatch failures are
    /// logged, not propagated: the log row remains for a retry.
    pub fn process_product_action(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        action_type: &str,
        reason: &str,
        custom_reason: Option<&str>,
    ) -> Result<ProductActionOutcome, PantryError> {
        let outcome =
            self.record_product_action(user_id, product_id, action_type, reason, custom_reason)?;
        if let Err(e) =
            self.process_inventory_log(outcome.log.log_id, Some(outcome.state_before))
        {
            warn!(
                "dispatch of product action log {} failed: {}",
                outcome.log.log_id, e
            );
        }
        Ok(outcome)
    }

    /// Fold the full ordered log of one product into a fresh state. The
    /// pre-purchase coarse level is re-derived from the state itself, so the
    /// fold is deterministic given the log alone.
    pub fn replay_product(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CycleState, PantryError> {
        let now = self.clock.now();
        let (_, cfg) = self.load_cfg_and_profile(user_id)?;
        let category_id = self.category_of(user_id, product_id)?;
        let rows = self.repo.list_log_rows(user_id, product_id)?;

        let seed_ts = rows.first().map(|r| r.occurred_at).unwrap_or(now);
        let mut state = CycleState::init_from_category(category_id, &cfg, seed_ts);

        for row in &rows {
            let (purchase_ev, feedback_ev) = classify_log_row(row);
            if let Some(ev) = &purchase_ev {
                let days = state.compute_days_left(ev.ts, 1.0, None);
                let pre = derive_state(days, state.cycle_mean_days, &cfg);
                state.apply_purchase(ev, &cfg, Some(pre));
            }
            if let Some(ev) = &feedback_ev {
                state.apply_feedback(ev, &cfg);
            }
        }
        Ok(state)
    }

    /// Daily 00:00 UTC job: walk every non-empty inventory product one day
    /// forward. Returns the number of products updated.
    pub fn run_state_decay(&self) -> Result<usize, PantryError> {
        let now = self.clock.now();
        let mut updated = 0usize;

        for user_id in self.repo.list_inventory_users()? {
            let (profile_id, cfg) = match self.load_cfg_and_profile(user_id) {
                Ok(v) => v,
                Err(e) => {
                    warn!("state decay: skipping user {}: {}", user_id, e);
                    continue;
                }
            };

            for (product_id, category_id) in self.repo.get_user_inventory_products(user_id)? {
                match self.decay_one(user_id, product_id, category_id, profile_id, &cfg, now) {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("state decay failed for product {}: {}", product_id, e);
                    }
                }
            }
        }

        info!("🌙 State decay pass complete: {} products updated", updated);
        Ok(updated)
    }

    fn decay_one(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        category_id: Option<Uuid>,
        profile_id: Uuid,
        cfg: &PredictorConfig,
        now: DateTime<Utc>,
    ) -> Result<bool, PantryError> {
        if self.repo.get_current_inventory_state(user_id, product_id)?
            == Some(InventoryState::Empty)
        {
            return Ok(false);
        }

        let mut state = self.ensure_state(user_id, product_id, cfg, category_id, now)?;

        let d0 = match self.repo.get_current_inventory_days(user_id, product_id)? {
            Some(days) => days,
            None => {
                let multiplier = self.habit_multiplier(user_id, product_id, category_id, now);
                state.compute_days_left(now, multiplier, None)
            }
        };
        let d1 = (d0 - 1.0).max(0.0);

        if d1 <= 0.0 && state.empty_at.is_none() {
            state.empty_at = Some(now);
        }

        let coarse = derive_state(d1, state.cycle_mean_days, cfg);
        let confidence = state.compute_confidence(now, cfg);

        self.repo.upsert_predictor_state(
            user_id,
            product_id,
            profile_id,
            &state.to_params_json(),
            confidence,
            now,
        )?;
        self.repo.upsert_inventory_days_estimate(
            user_id,
            product_id,
            d1,
            coarse,
            confidence,
            InventorySource::System,
            None,
        )?;
        Ok(true)
    }

    /// Weekly 00:00 UTC job: each product re-estimates on the weekday of its
    /// earliest log row. The cycle average is already folded in at purchase
    /// time, so the slot currently only counts matches; it exists so a
    /// purely time-driven re-estimation can be re-enabled without touching
    /// the dispatcher.
    pub fn run_weekly_reestimation(&self) -> Result<usize, PantryError> {
        let now = self.clock.now();
        let today = now.date_naive().weekday();
        let mut matched = 0usize;

        for user_id in self.repo.list_inventory_users()? {
            for (product_id, _) in self.repo.get_user_inventory_products(user_id)? {
                match self.repo.first_log_occurred_at(user_id, product_id) {
                    Ok(Some(first)) if first.date_naive().weekday() == today => {
                        debug!(
                            "weekly re-estimation slot hit for product {} (created {})",
                            product_id,
                            first.date_naive()
                        );
                        matched += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            "weekly re-estimation failed for product {}: {}",
                            product_id, e
                        );
                    }
                }
            }
        }

        info!(
            "📅 Weekly re-estimation pass complete: {} products on today's weekday",
            matched
        );
        Ok(matched)
    }
}
