//! SQLite-backed pantry repository.
//!
//! All predictor persistence goes through here: profiles, per-product
//! predictor state, inventory rows, the append-only event log, forecast
//! snapshots, and habits. WAL mode for concurrent reads during writes;
//! callers share the store behind an `Arc`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    Forecast, Habit, HabitStatus, InventoryAction, InventoryLogRow, InventorySource,
    InventoryState, NewLogEntry,
};
use crate::predictor::config::default_profile_config_json;
use crate::predictor::events::parse_utc_timestamp;

/// Active predictor profile for a user.
#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub profile_id: Uuid,
    pub config: Value,
}

/// Persisted predictor state row.
#[derive(Debug, Clone)]
pub struct PredictorStateRow {
    pub params: Value,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
    pub profile_id: Uuid,
}

/// One forecast snapshot.
#[derive(Debug, Clone)]
pub struct ForecastRow {
    pub expected_days_left: f64,
    pub predicted_state: InventoryState,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
    pub trigger_log_id: Option<Uuid>,
}

/// Abstract store surface the predictor requires. Blocking I/O; the handle
/// is shared and thread-safe.
pub trait PantryRepository: Send + Sync {
    /// Active profile for the user, lazily created with system category
    /// priors on first read.
    fn get_active_profile(&self, user_id: Uuid) -> Result<ProfileRow>;

    fn get_user_inventory_products(&self, user_id: Uuid) -> Result<Vec<(Uuid, Option<Uuid>)>>;

    fn get_predictor_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<PredictorStateRow>>;

    fn upsert_predictor_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        profile_id: Uuid,
        params: &Value,
        confidence: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn upsert_inventory_days_estimate(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        days_left: f64,
        state: InventoryState,
        confidence: f64,
        source: InventorySource,
        displayed_name: Option<&str>,
    ) -> Result<()>;

    fn insert_forecast(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        forecast: &Forecast,
        trigger_log_id: Option<Uuid>,
    ) -> Result<()>;

    fn latest_forecast(&self, user_id: Uuid, product_id: Uuid) -> Result<Option<ForecastRow>>;

    fn get_inventory_log_row(&self, log_id: Uuid) -> Result<Option<InventoryLogRow>>;

    fn append_inventory_log(
        &self,
        entry: &NewLogEntry,
        now: DateTime<Utc>,
    ) -> Result<InventoryLogRow>;

    /// Full ordered log of one (user, product), oldest first. Offline replay.
    fn list_log_rows(&self, user_id: Uuid, product_id: Uuid) -> Result<Vec<InventoryLogRow>>;

    /// Earliest event for a product; drives the weekly re-estimation slot.
    fn first_log_occurred_at(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Effects of all ACTIVE habits whose date window covers `now`.
    fn get_active_habit_effects(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Value>>;

    fn insert_habit(&self, habit: &Habit) -> Result<()>;

    /// Remove a habit, returning its status and effects when it existed.
    fn delete_habit(&self, user_id: Uuid, habit_id: Uuid) -> Result<Option<(HabitStatus, Value)>>;

    fn get_current_inventory_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<InventoryState>>;

    fn get_current_inventory_days(&self, user_id: Uuid, product_id: Uuid) -> Result<Option<f64>>;

    /// Every user holding at least one inventory row. Scheduler sweeps.
    fn list_inventory_users(&self) -> Result<Vec<Uuid>>;

    fn upsert_category(&self, category_id: Uuid, name: &str) -> Result<()>;

    fn upsert_product(&self, product_id: Uuid, name: &str, category_id: Option<Uuid>)
        -> Result<()>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS product_categories (
    category_id TEXT PRIMARY KEY,
    category_name TEXT NOT NULL UNIQUE
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS products (
    product_id TEXT PRIMARY KEY,
    product_name TEXT NOT NULL,
    category_id TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS predictor_profiles (
    profile_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    method TEXT NOT NULL,
    config_json TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_profiles_user_active
    ON predictor_profiles(user_id, is_active);

CREATE TABLE IF NOT EXISTS product_predictor_state (
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    profile_id TEXT NOT NULL,
    params_json TEXT NOT NULL,
    confidence REAL NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, product_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS inventory (
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    state TEXT NOT NULL,
    estimated_qty REAL,
    qty_unit TEXT NOT NULL DEFAULT 'days',
    confidence REAL,
    last_source TEXT,
    last_updated_at TEXT,
    displayed_name TEXT,
    PRIMARY KEY (user_id, product_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS inventory_log (
    log_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    action TEXT NOT NULL,
    delta_state TEXT,
    action_confidence REAL NOT NULL DEFAULT 1.0,
    occurred_at TEXT NOT NULL,
    source TEXT NOT NULL,
    note TEXT,
    receipt_item_id TEXT,
    shopping_list_item_id TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_inventory_log_product
    ON inventory_log(user_id, product_id, occurred_at);

CREATE TABLE IF NOT EXISTS inventory_forecasts (
    forecast_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    expected_days_left REAL NOT NULL,
    predicted_state TEXT NOT NULL,
    confidence REAL NOT NULL,
    trigger_log_id TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_forecasts_product
    ON inventory_forecasts(user_id, product_id, generated_at DESC);

CREATE TABLE IF NOT EXISTS habits (
    habit_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    effects_json TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_habits_user_status
    ON habits(user_id, status);
"#;

/// SQLite store shared across request handlers and the background jobs.
pub struct PantryStore {
    conn: Arc<Mutex<Connection>>,
}

impl PantryStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("🥫 Pantry database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid {} uuid: {}", what, s))
}

struct RawLogRow {
    log_id: String,
    user_id: String,
    product_id: String,
    action: String,
    delta_state: Option<String>,
    action_confidence: f64,
    occurred_at: String,
    source: String,
    note: Option<String>,
    receipt_item_id: Option<String>,
    shopping_list_item_id: Option<String>,
}

impl RawLogRow {
    fn into_row(self) -> Result<InventoryLogRow> {
        Ok(InventoryLogRow {
            log_id: parse_uuid(&self.log_id, "log_id")?,
            user_id: parse_uuid(&self.user_id, "user_id")?,
            product_id: parse_uuid(&self.product_id, "product_id")?,
            action: InventoryAction::from_str(&self.action)
                .with_context(|| format!("unknown action in log: {}", self.action))?,
            delta_state: self
                .delta_state
                .as_deref()
                .and_then(InventoryState::from_str),
            action_confidence: self.action_confidence,
            occurred_at: parse_utc_timestamp(&self.occurred_at)?,
            source: InventorySource::from_str(&self.source).unwrap_or(InventorySource::System),
            note: self.note,
            receipt_item_id: self.receipt_item_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
            shopping_list_item_id: self
                .shopping_list_item_id
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok()),
        })
    }
}

const LOG_COLUMNS: &str = "log_id, user_id, product_id, action, delta_state, action_confidence, \
                           occurred_at, source, note, receipt_item_id, shopping_list_item_id";

fn map_raw_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLogRow> {
    Ok(RawLogRow {
        log_id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        action: row.get(3)?,
        delta_state: row.get(4)?,
        action_confidence: row.get(5)?,
        occurred_at: row.get(6)?,
        source: row.get(7)?,
        note: row.get(8)?,
        receipt_item_id: row.get(9)?,
        shopping_list_item_id: row.get(10)?,
    })
}

impl PantryRepository for PantryStore {
    fn get_active_profile(&self, user_id: Uuid) -> Result<ProfileRow> {
        let conn = self.conn.lock();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT profile_id, config_json FROM predictor_profiles
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY created_at LIMIT 1",
                params![user_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((profile_id, config_json)) = existing {
            return Ok(ProfileRow {
                profile_id: parse_uuid(&profile_id, "profile_id")?,
                config: serde_json::from_str(&config_json)
                    .context("Failed to parse profile config")?,
            });
        }

        // First read: seed a default profile with priors for every known
        // category.
        let mut stmt =
            conn.prepare("SELECT category_id, category_name FROM product_categories")?;
        let raw_categories = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut categories = Vec::with_capacity(raw_categories.len());
        for (id, name) in raw_categories {
            categories.push((parse_uuid(&id, "category_id")?, name));
        }

        let config = default_profile_config_json(&categories);
        let profile_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO predictor_profiles
                 (profile_id, user_id, name, method, config_json, is_active, created_at)
             VALUES (?1, ?2, 'Default Profile', 'CYCLE_EMA', ?3, 1, ?4)",
            params![
                profile_id.to_string(),
                user_id.to_string(),
                config.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert default predictor profile")?;

        info!("📋 Created default predictor profile for user {}", user_id);
        Ok(ProfileRow { profile_id, config })
    }

    fn get_user_inventory_products(&self, user_id: Uuid) -> Result<Vec<(Uuid, Option<Uuid>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.product_id, p.category_id
             FROM inventory i
             LEFT JOIN products p ON p.product_id = i.product_id
             WHERE i.user_id = ?1",
        )?;
        let raw = stmt
            .query_map(params![user_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (product_id, category_id) in raw {
            out.push((
                parse_uuid(&product_id, "product_id")?,
                category_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
            ));
        }
        Ok(out)
    }

    fn get_predictor_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<PredictorStateRow>> {
        let conn = self.conn.lock();
        let raw: Option<(String, f64, String, String)> = conn
            .query_row(
                "SELECT params_json, confidence, updated_at, profile_id
                 FROM product_predictor_state
                 WHERE user_id = ?1 AND product_id = ?2",
                params![user_id.to_string(), product_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((params_json, confidence, updated_at, profile_id)) = raw else {
            return Ok(None);
        };
        Ok(Some(PredictorStateRow {
            params: serde_json::from_str(&params_json)
                .context("Failed to parse predictor state params")?,
            confidence,
            updated_at: parse_utc_timestamp(&updated_at)?,
            profile_id: parse_uuid(&profile_id, "profile_id")?,
        }))
    }

    fn upsert_predictor_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        profile_id: Uuid,
        params: &Value,
        confidence: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO product_predictor_state
                 (user_id, product_id, profile_id, params_json, confidence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, product_id) DO UPDATE SET
                 profile_id = excluded.profile_id,
                 params_json = excluded.params_json,
                 confidence = excluded.confidence,
                 updated_at = excluded.updated_at",
            params![
                user_id.to_string(),
                product_id.to_string(),
                profile_id.to_string(),
                params.to_string(),
                confidence,
                updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert predictor state")?;
        Ok(())
    }

    fn upsert_inventory_days_estimate(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        days_left: f64,
        state: InventoryState,
        confidence: f64,
        source: InventorySource,
        displayed_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inventory
                 (user_id, product_id, state, estimated_qty, qty_unit, confidence,
                  last_source, last_updated_at, displayed_name)
             VALUES (?1, ?2, ?3, ?4, 'days', ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, product_id) DO UPDATE SET
                 state = excluded.state,
                 estimated_qty = excluded.estimated_qty,
                 qty_unit = excluded.qty_unit,
                 confidence = excluded.confidence,
                 last_source = excluded.last_source,
                 last_updated_at = excluded.last_updated_at,
                 displayed_name = COALESCE(excluded.displayed_name, inventory.displayed_name)",
            params![
                user_id.to_string(),
                product_id.to_string(),
                state.as_str(),
                days_left,
                confidence,
                source.as_str(),
                Utc::now().to_rfc3339(),
                displayed_name,
            ],
        )
        .context("Failed to upsert inventory estimate")?;
        Ok(())
    }

    fn insert_forecast(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        forecast: &Forecast,
        trigger_log_id: Option<Uuid>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inventory_forecasts
                 (forecast_id, user_id, product_id, generated_at, expected_days_left,
                  predicted_state, confidence, trigger_log_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                user_id.to_string(),
                product_id.to_string(),
                forecast.generated_at.to_rfc3339(),
                forecast.expected_days_left,
                forecast.predicted_state.as_str(),
                forecast.confidence,
                trigger_log_id.map(|id| id.to_string()),
            ],
        )
        .context("Failed to insert forecast snapshot")?;
        Ok(())
    }

    fn latest_forecast(&self, user_id: Uuid, product_id: Uuid) -> Result<Option<ForecastRow>> {
        let conn = self.conn.lock();
        let raw: Option<(f64, String, f64, String, Option<String>)> = conn
            .query_row(
                "SELECT expected_days_left, predicted_state, confidence, generated_at,
                        trigger_log_id
                 FROM inventory_forecasts
                 WHERE user_id = ?1 AND product_id = ?2
                 ORDER BY generated_at DESC LIMIT 1",
                params![user_id.to_string(), product_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((expected_days_left, predicted_state, confidence, generated_at, trigger)) = raw
        else {
            return Ok(None);
        };
        Ok(Some(ForecastRow {
            expected_days_left,
            predicted_state: InventoryState::from_str(&predicted_state)
                .unwrap_or(InventoryState::Unknown),
            confidence,
            generated_at: parse_utc_timestamp(&generated_at)?,
            trigger_log_id: trigger.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        }))
    }

    fn get_inventory_log_row(&self, log_id: Uuid) -> Result<Option<InventoryLogRow>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM inventory_log WHERE log_id = ?1"),
                params![log_id.to_string()],
                map_raw_log,
            )
            .optional()?;

        raw.map(RawLogRow::into_row).transpose()
    }

    fn append_inventory_log(
        &self,
        entry: &NewLogEntry,
        now: DateTime<Utc>,
    ) -> Result<InventoryLogRow> {
        let row = InventoryLogRow {
            log_id: Uuid::new_v4(),
            user_id: entry.user_id,
            product_id: entry.product_id,
            action: entry.action,
            delta_state: entry.delta_state,
            action_confidence: entry.action_confidence,
            occurred_at: entry.occurred_at.unwrap_or(now),
            source: entry.source,
            note: entry.note.clone(),
            receipt_item_id: None,
            shopping_list_item_id: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inventory_log
                 (log_id, user_id, product_id, action, delta_state, action_confidence,
                  occurred_at, source, note, receipt_item_id, shopping_list_item_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL)",
            params![
                row.log_id.to_string(),
                row.user_id.to_string(),
                row.product_id.to_string(),
                row.action.as_str(),
                row.delta_state.map(|s| s.as_str()),
                row.action_confidence,
                row.occurred_at.to_rfc3339(),
                row.source.as_str(),
                row.note,
            ],
        )
        .context("Failed to append inventory log row")?;

        Ok(row)
    }

    fn list_log_rows(&self, user_id: Uuid, product_id: Uuid) -> Result<Vec<InventoryLogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM inventory_log
             WHERE user_id = ?1 AND product_id = ?2
             ORDER BY occurred_at, log_id"
        ))?;
        let raw = stmt
            .query_map(
                params![user_id.to_string(), product_id.to_string()],
                map_raw_log,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter().map(RawLogRow::into_row).collect()
    }

    fn first_log_occurred_at(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT occurred_at FROM inventory_log
                 WHERE user_id = ?1 AND product_id = ?2
                 ORDER BY occurred_at LIMIT 1",
                params![user_id.to_string(), product_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        raw.as_deref().map(parse_utc_timestamp).transpose()
    }

    fn get_active_habit_effects(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        let now_str = now.to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT effects_json FROM habits
             WHERE user_id = ?1 AND status = 'ACTIVE'
               AND (start_date IS NULL OR start_date <= ?2)
               AND (end_date IS NULL OR end_date >= ?2)",
        )?;
        let raw = stmt
            .query_map(params![user_id.to_string(), now_str], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for effects_json in raw {
            match serde_json::from_str(&effects_json) {
                Ok(v) => out.push(v),
                Err(e) => warn!("skipping unparseable habit effects row: {}", e),
            }
        }
        Ok(out)
    }

    fn insert_habit(&self, habit: &Habit) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO habits
                 (habit_id, user_id, status, effects_json, start_date, end_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                habit.habit_id.to_string(),
                habit.user_id.to_string(),
                habit.status.as_str(),
                habit.effects.to_string(),
                habit.start_date.map(|t| t.to_rfc3339()),
                habit.end_date.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert habit")?;
        Ok(())
    }

    fn delete_habit(&self, user_id: Uuid, habit_id: Uuid) -> Result<Option<(HabitStatus, Value)>> {
        let conn = self.conn.lock();
        let raw: Option<(String, String)> = conn
            .query_row(
                "SELECT status, effects_json FROM habits
                 WHERE user_id = ?1 AND habit_id = ?2",
                params![user_id.to_string(), habit_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((status, effects_json)) = raw else {
            return Ok(None);
        };

        conn.execute(
            "DELETE FROM habits WHERE user_id = ?1 AND habit_id = ?2",
            params![user_id.to_string(), habit_id.to_string()],
        )?;

        Ok(Some((
            HabitStatus::from_str(&status).unwrap_or(HabitStatus::Inactive),
            serde_json::from_str(&effects_json).unwrap_or(Value::Null),
        )))
    }

    fn get_current_inventory_state(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<InventoryState>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM inventory WHERE user_id = ?1 AND product_id = ?2",
                params![user_id.to_string(), product_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(InventoryState::from_str))
    }

    fn get_current_inventory_days(&self, user_id: Uuid, product_id: Uuid) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let raw: Option<Option<f64>> = conn
            .query_row(
                "SELECT estimated_qty FROM inventory WHERE user_id = ?1 AND product_id = ?2",
                params![user_id.to_string(), product_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.flatten())
    }

    fn list_inventory_users(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM inventory")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for user_id in raw {
            out.push(parse_uuid(&user_id, "user_id")?);
        }
        Ok(out)
    }

    fn upsert_category(&self, category_id: Uuid, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO product_categories (category_id, category_name)
             VALUES (?1, ?2)
             ON CONFLICT(category_id) DO UPDATE SET category_name = excluded.category_name",
            params![category_id.to_string(), name],
        )
        .context("Failed to upsert category")?;
        Ok(())
    }

    fn upsert_product(
        &self,
        product_id: Uuid,
        name: &str,
        category_id: Option<Uuid>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO products (product_id, product_name, category_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(product_id) DO UPDATE SET
                 product_name = excluded.product_name,
                 category_id = excluded.category_id",
            params![
                product_id.to_string(),
                name,
                category_id.map(|c| c.to_string()),
            ],
        )
        .context("Failed to upsert product")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (PantryStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = PantryStore::new(temp_file.path().to_str().unwrap()).unwrap();
        (store, temp_file)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_lazy_profile_creation_seeds_category_priors() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let dairy = Uuid::new_v4();
        store.upsert_category(dairy, "Dairy & Eggs").unwrap();

        let profile = store.get_active_profile(user).unwrap();
        let priors = profile.config.get("category_priors").unwrap();
        assert_eq!(
            priors.get(dairy.to_string().as_str()).unwrap().get("mean_days"),
            Some(&serde_json::json!(5.0))
        );

        // second read returns the same profile, no duplicate insert
        let again = store.get_active_profile(user).unwrap();
        assert_eq!(again.profile_id, profile.profile_id);
    }

    #[test]
    fn test_predictor_state_round_trip() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let product = Uuid::new_v4();
        let profile = store.get_active_profile(user).unwrap();

        assert!(store.get_predictor_state(user, product).unwrap().is_none());

        let params = serde_json::json!({"cycle_mean_days": 6.5, "n_completed_cycles": 2});
        store
            .upsert_predictor_state(user, product, profile.profile_id, &params, 0.7, t0())
            .unwrap();

        let row = store.get_predictor_state(user, product).unwrap().unwrap();
        assert_eq!(row.params, params);
        assert_eq!(row.confidence, 0.7);
        assert_eq!(row.updated_at, t0());
        assert_eq!(row.profile_id, profile.profile_id);

        // upsert overwrites in place
        let params2 = serde_json::json!({"cycle_mean_days": 5.0});
        store
            .upsert_predictor_state(user, product, profile.profile_id, &params2, 0.8, t0())
            .unwrap();
        let row = store.get_predictor_state(user, product).unwrap().unwrap();
        assert_eq!(row.params, params2);
    }

    #[test]
    fn test_inventory_upsert_and_reads() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let product = Uuid::new_v4();

        store
            .upsert_inventory_days_estimate(
                user,
                product,
                4.5,
                InventoryState::Medium,
                0.6,
                InventorySource::System,
                Some("Milk 3%"),
            )
            .unwrap();

        assert_eq!(
            store.get_current_inventory_state(user, product).unwrap(),
            Some(InventoryState::Medium)
        );
        assert_eq!(
            store.get_current_inventory_days(user, product).unwrap(),
            Some(4.5)
        );
        assert_eq!(store.list_inventory_users().unwrap(), vec![user]);

        // a later system write without a name keeps the displayed name
        store
            .upsert_inventory_days_estimate(
                user,
                product,
                3.5,
                InventoryState::Medium,
                0.6,
                InventorySource::System,
                None,
            )
            .unwrap();
        let conn = store.conn.lock();
        let name: String = conn
            .query_row(
                "SELECT displayed_name FROM inventory WHERE user_id = ?1",
                params![user.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "Milk 3%");
    }

    #[test]
    fn test_log_append_get_and_first_occurred_at() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let product = Uuid::new_v4();

        let first = store
            .append_inventory_log(
                &NewLogEntry {
                    user_id: user,
                    product_id: product,
                    action: InventoryAction::Purchase,
                    delta_state: Some(InventoryState::Full),
                    action_confidence: 1.0,
                    occurred_at: Some(t0()),
                    source: InventorySource::Receipt,
                    note: None,
                },
                t0(),
            )
            .unwrap();
        store
            .append_inventory_log(
                &NewLogEntry {
                    user_id: user,
                    product_id: product,
                    action: InventoryAction::Empty,
                    delta_state: Some(InventoryState::Empty),
                    action_confidence: 1.0,
                    occurred_at: Some(t0() + chrono::Duration::days(6)),
                    source: InventorySource::Manual,
                    note: Some("EMPTY: ran out".to_string()),
                },
                t0(),
            )
            .unwrap();

        let fetched = store.get_inventory_log_row(first.log_id).unwrap().unwrap();
        assert_eq!(fetched.action, InventoryAction::Purchase);
        assert_eq!(fetched.occurred_at, t0());
        assert_eq!(fetched.source, InventorySource::Receipt);

        assert!(store
            .get_inventory_log_row(Uuid::new_v4())
            .unwrap()
            .is_none());

        assert_eq!(store.first_log_occurred_at(user, product).unwrap(), Some(t0()));

        let rows = store.list_log_rows(user, product).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, InventoryAction::Purchase);
        assert_eq!(rows[1].action, InventoryAction::Empty);
    }

    #[test]
    fn test_active_habit_window_filtering() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let now = t0();

        let mut habit = Habit {
            habit_id: Uuid::new_v4(),
            user_id: user,
            status: HabitStatus::Active,
            effects: serde_json::json!({"global_multiplier": 2.0}),
            start_date: None,
            end_date: None,
        };
        store.insert_habit(&habit).unwrap();

        habit.habit_id = Uuid::new_v4();
        habit.status = HabitStatus::Inactive;
        store.insert_habit(&habit).unwrap();

        habit.habit_id = Uuid::new_v4();
        habit.status = HabitStatus::Active;
        habit.start_date = Some(now + chrono::Duration::days(3));
        store.insert_habit(&habit).unwrap();

        habit.habit_id = Uuid::new_v4();
        habit.start_date = Some(now - chrono::Duration::days(3));
        habit.end_date = Some(now + chrono::Duration::days(3));
        store.insert_habit(&habit).unwrap();

        let effects = store.get_active_habit_effects(user, now).unwrap();
        // unbounded active + in-window active
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn test_delete_habit_returns_effects() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let habit = Habit {
            habit_id: Uuid::new_v4(),
            user_id: user,
            status: HabitStatus::Active,
            effects: serde_json::json!({"global_multiplier": 1.5}),
            start_date: None,
            end_date: None,
        };
        store.insert_habit(&habit).unwrap();

        let (status, effects) = store.delete_habit(user, habit.habit_id).unwrap().unwrap();
        assert_eq!(status, HabitStatus::Active);
        assert_eq!(effects, habit.effects);

        assert!(store.delete_habit(user, habit.habit_id).unwrap().is_none());
        assert!(store.get_active_habit_effects(user, t0()).unwrap().is_empty());
    }

    #[test]
    fn test_latest_forecast_ordering() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let product = Uuid::new_v4();

        for (offset, days_left) in [(0, 5.0), (2, 3.0), (1, 4.0)] {
            store
                .insert_forecast(
                    user,
                    product,
                    &Forecast {
                        expected_days_left: days_left,
                        predicted_state: InventoryState::Medium,
                        confidence: 0.5,
                        generated_at: t0() + chrono::Duration::days(offset),
                    },
                    None,
                )
                .unwrap();
        }

        let latest = store.latest_forecast(user, product).unwrap().unwrap();
        assert_eq!(latest.expected_days_left, 3.0);

        assert!(store.latest_forecast(user, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_inventory_products_join_categories() {
        let (store, _temp) = create_test_store();
        let user = Uuid::new_v4();
        let category = Uuid::new_v4();
        let with_cat = Uuid::new_v4();
        let without_cat = Uuid::new_v4();

        store.upsert_category(category, "Beverages").unwrap();
        store.upsert_product(with_cat, "Orange Juice", Some(category)).unwrap();
        store.upsert_product(without_cat, "Mystery Item", None).unwrap();

        for product in [with_cat, without_cat] {
            store
                .upsert_inventory_days_estimate(
                    user,
                    product,
                    2.0,
                    InventoryState::Low,
                    0.5,
                    InventorySource::System,
                    None,
                )
                .unwrap();
        }

        let mut products = store.get_user_inventory_products(user).unwrap();
        products.sort_by_key(|(id, _)| *id);
        assert_eq!(products.len(), 2);
        let cat_of = |id: Uuid| {
            products
                .iter()
                .find(|(p, _)| *p == id)
                .map(|(_, c)| *c)
                .unwrap()
        };
        assert_eq!(cat_of(with_cat), Some(category));
        assert_eq!(cat_of(without_cat), None);
    }
}
