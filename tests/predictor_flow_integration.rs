//! End-to-end predictor flow against a real SQLite store.
//!
//! Walks one product through the whole lifecycle: cold start from a
//! category prior, a completed consumption cycle, a habit being created and
//! deleted, the daily decay job, the weekly re-estimation slot, and an
//! offline replay of the log.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::NamedTempFile;
use uuid::Uuid;

use pantrybot_backend::clock::FixedClock;
use pantrybot_backend::models::{
    InventoryAction, InventorySource, InventoryState, NewLogEntry,
};
use pantrybot_backend::predictor::service::PredictorService;
use pantrybot_backend::storage::{PantryRepository, PantryStore};

struct TestEnv {
    service: PredictorService,
    repo: Arc<PantryStore>,
    clock: Arc<FixedClock>,
    user: Uuid,
    product: Uuid,
    _temp: NamedTempFile,
}

fn t0() -> DateTime<Utc> {
    // a Tuesday morning
    Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap()
}

fn setup() -> TestEnv {
    let temp = NamedTempFile::new().unwrap();
    let repo = Arc::new(PantryStore::new(temp.path().to_str().unwrap()).unwrap());
    let clock = Arc::new(FixedClock::new(t0()));
    let service = PredictorService::new(repo.clone(), clock.clone());

    let user = Uuid::new_v4();
    let category = Uuid::new_v4();
    let product = Uuid::new_v4();

    repo.upsert_category(category, "Dairy & Eggs").unwrap();
    repo.upsert_product(product, "Milk 3%", Some(category)).unwrap();
    repo.upsert_inventory_days_estimate(
        user,
        product,
        0.0,
        InventoryState::Unknown,
        0.0,
        InventorySource::Manual,
        Some("Milk 3%"),
    )
    .unwrap();

    TestEnv {
        service,
        repo,
        clock,
        user,
        product,
        _temp: temp,
    }
}

fn log_at(
    env: &TestEnv,
    action: InventoryAction,
    delta: Option<InventoryState>,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> Uuid {
    env.clock.set(at);
    env.repo
        .append_inventory_log(
            &NewLogEntry {
                user_id: env.user,
                product_id: env.product,
                action,
                delta_state: delta,
                action_confidence: 1.0,
                occurred_at: Some(at),
                source: InventorySource::Manual,
                note: note.map(str::to_string),
            },
            at,
        )
        .unwrap()
        .log_id
}

#[test]
fn full_product_lifecycle() {
    let env = setup();

    // Cold start: the dairy category prior (5 days) drives the first forecast.
    let log = log_at(
        &env,
        InventoryAction::Purchase,
        Some(InventoryState::Full),
        None,
        t0(),
    );
    env.service.process_inventory_log(log, None).unwrap();

    assert_eq!(
        env.repo
            .get_current_inventory_days(env.user, env.product)
            .unwrap(),
        Some(5.0)
    );
    assert_eq!(
        env.repo
            .get_current_inventory_state(env.user, env.product)
            .unwrap(),
        Some(InventoryState::Full)
    );

    // Ran out after four days, repurchased a day later: one observed cycle.
    let log = log_at(
        &env,
        InventoryAction::Empty,
        Some(InventoryState::Empty),
        Some("EMPTY: ran out"),
        t0() + Duration::days(4),
    );
    env.service.process_inventory_log(log, None).unwrap();

    let log = log_at(
        &env,
        InventoryAction::Purchase,
        Some(InventoryState::Full),
        None,
        t0() + Duration::days(5),
    );
    env.service.process_inventory_log(log, None).unwrap();

    let state = env.service.replay_product(env.user, env.product).unwrap();
    assert_eq!(state.n_completed_cycles, 1);

    assert_eq!(
        env.repo
            .get_current_inventory_days(env.user, env.product)
            .unwrap(),
        Some(4.0)
    );

    // A doubling habit halves the learned mean and the displayed forecast.
    let habit = pantrybot_backend::models::Habit {
        habit_id: Uuid::new_v4(),
        user_id: env.user,
        status: pantrybot_backend::models::HabitStatus::Active,
        effects: serde_json::json!({ "global_multiplier": 2.0 }),
        start_date: None,
        end_date: None,
    };
    env.service.create_habit(&habit).unwrap();

    let row = env
        .repo
        .get_predictor_state(env.user, env.product)
        .unwrap()
        .unwrap();
    let mean = row.params.get("cycle_mean_days").unwrap().as_f64().unwrap();
    assert!((mean - 2.0).abs() < 1e-9);
    assert_eq!(
        env.repo
            .get_current_inventory_days(env.user, env.product)
            .unwrap(),
        Some(1.0)
    );

    // Deleting the habit restores the learned mean and the cached forecast.
    assert!(env.service.remove_habit(env.user, habit.habit_id).unwrap());
    let row = env
        .repo
        .get_predictor_state(env.user, env.product)
        .unwrap()
        .unwrap();
    let mean = row.params.get("cycle_mean_days").unwrap().as_f64().unwrap();
    assert!((mean - 4.0).abs() < 1e-9);
    assert_eq!(
        env.repo
            .get_current_inventory_days(env.user, env.product)
            .unwrap(),
        Some(4.0)
    );

    // Daily decay takes one day off and re-derives the coarse state.
    env.clock.set(t0() + Duration::days(6));
    env.service.run_state_decay().unwrap();
    assert_eq!(
        env.repo
            .get_current_inventory_days(env.user, env.product)
            .unwrap(),
        Some(3.0)
    );
    assert_eq!(
        env.repo
            .get_current_inventory_state(env.user, env.product)
            .unwrap(),
        Some(InventoryState::Full)
    );

    // Weekly slot fires on the weekday of the first log row.
    env.clock.set(t0() + Duration::days(7)); // Tuesday again
    assert_eq!(env.service.run_weekly_reestimation().unwrap(), 1);
    env.clock.set(t0() + Duration::days(8));
    assert_eq!(env.service.run_weekly_reestimation().unwrap(), 0);

    // The forecast history is linked to the triggering log rows.
    let latest = env
        .repo
        .latest_forecast(env.user, env.product)
        .unwrap()
        .unwrap();
    assert!(latest.confidence > 0.0);

    // Replaying the log twice lands on the same state.
    let a = env.service.replay_product(env.user, env.product).unwrap();
    let b = env.service.replay_product(env.user, env.product).unwrap();
    assert_eq!(a, b);
}

#[test]
fn more_less_feedback_scales_only_the_display() {
    let env = setup();

    let log = log_at(
        &env,
        InventoryAction::Purchase,
        Some(InventoryState::Full),
        None,
        t0(),
    );
    env.service.process_inventory_log(log, None).unwrap();

    let before = env
        .repo
        .get_current_inventory_days(env.user, env.product)
        .unwrap()
        .unwrap();

    env.clock.set(t0() + Duration::days(1));
    let outcome = env
        .service
        .apply_more_less_feedback(env.user, env.product, "less")
        .unwrap();
    assert!((outcome.days_left - before * 0.85).abs() < 1e-9);

    // the learned mean is untouched by MORE/LESS
    let row = env
        .repo
        .get_predictor_state(env.user, env.product)
        .unwrap()
        .unwrap();
    let mean = row.params.get("cycle_mean_days").unwrap().as_f64().unwrap();
    assert!((mean - 5.0).abs() < 1e-9);

    // the ADJUST row it appended classifies as feedback, not a purchase
    let rows = env.repo.list_log_rows(env.user, env.product).unwrap();
    assert_eq!(rows.last().unwrap().action, InventoryAction::Adjust);
}
