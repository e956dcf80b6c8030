use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Coarse inventory stock level, ordered EMPTY < LOW < MEDIUM < FULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryState {
    Empty,
    Low,
    Medium,
    Full,
    Unknown,
}

impl InventoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryState::Empty => "EMPTY",
            InventoryState::Low => "LOW",
            InventoryState::Medium => "MEDIUM",
            InventoryState::Full => "FULL",
            InventoryState::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "EMPTY" => Some(InventoryState::Empty),
            "LOW" => Some(InventoryState::Low),
            "MEDIUM" => Some(InventoryState::Medium),
            "FULL" => Some(InventoryState::Full),
            "UNKNOWN" => Some(InventoryState::Unknown),
            _ => None,
        }
    }
}

/// Where an inventory mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventorySource {
    Receipt,
    ShoppingList,
    Manual,
    System,
}

impl InventorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventorySource::Receipt => "RECEIPT",
            InventorySource::ShoppingList => "SHOPPING_LIST",
            InventorySource::Manual => "MANUAL",
            InventorySource::System => "SYSTEM",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "RECEIPT" => Some(InventorySource::Receipt),
            "SHOPPING_LIST" => Some(InventorySource::ShoppingList),
            "MANUAL" => Some(InventorySource::Manual),
            "SYSTEM" => Some(InventorySource::System),
            _ => None,
        }
    }
}

/// Action recorded in the append-only inventory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryAction {
    Purchase,
    Repurchase,
    Adjust,
    Trash,
    Empty,
    Reset,
}

impl InventoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryAction::Purchase => "PURCHASE",
            InventoryAction::Repurchase => "REPURCHASE",
            InventoryAction::Adjust => "ADJUST",
            InventoryAction::Trash => "TRASH",
            InventoryAction::Empty => "EMPTY",
            InventoryAction::Reset => "RESET",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PURCHASE" => Some(InventoryAction::Purchase),
            "REPURCHASE" => Some(InventoryAction::Repurchase),
            "ADJUST" => Some(InventoryAction::Adjust),
            "TRASH" => Some(InventoryAction::Trash),
            "EMPTY" => Some(InventoryAction::Empty),
            "RESET" => Some(InventoryAction::Reset),
            _ => None,
        }
    }
}

/// User feedback kinds the predictor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackKind {
    More,
    Less,
    Exact,
    Empty,
    Wasted,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::More => "MORE",
            FeedbackKind::Less => "LESS",
            FeedbackKind::Exact => "EXACT",
            FeedbackKind::Empty => "EMPTY",
            FeedbackKind::Wasted => "WASTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MORE" => Some(FeedbackKind::More),
            "LESS" => Some(FeedbackKind::Less),
            "EXACT" => Some(FeedbackKind::Exact),
            "EMPTY" => Some(FeedbackKind::Empty),
            "WASTED" => Some(FeedbackKind::Wasted),
            _ => None,
        }
    }
}

/// One row of the append-only inventory event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryLogRow {
    pub log_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub action: InventoryAction,
    pub delta_state: Option<InventoryState>,
    pub action_confidence: f64,
    pub occurred_at: DateTime<Utc>,
    pub source: InventorySource,
    pub note: Option<String>,
    pub receipt_item_id: Option<Uuid>,
    pub shopping_list_item_id: Option<Uuid>,
}

/// Payload for appending a new log row; `occurred_at` defaults to now.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub action: InventoryAction,
    pub delta_state: Option<InventoryState>,
    pub action_confidence: f64,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source: InventorySource,
    pub note: Option<String>,
}

/// Point forecast for one (user, product).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub expected_days_left: f64,
    pub predicted_state: InventoryState,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

/// Habit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HabitStatus {
    Active,
    Inactive,
    Expired,
}

impl HabitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HabitStatus::Active => "ACTIVE",
            HabitStatus::Inactive => "INACTIVE",
            HabitStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ACTIVE" => Some(HabitStatus::Active),
            "INACTIVE" => Some(HabitStatus::Inactive),
            "EXPIRED" => Some(HabitStatus::Expired),
            _ => None,
        }
    }
}

/// Consumption-multiplier effects attached to a habit.
///
/// Missing fields contribute 1.0; a multiplier > 1 means faster consumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HabitEffects {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub product_multipliers: HashMap<Uuid, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub category_multipliers: HashMap<Uuid, f64>,
}

impl HabitEffects {
    pub fn is_empty(&self) -> bool {
        self.global_multiplier.is_none()
            && self.product_multipliers.is_empty()
            && self.category_multipliers.is_empty()
    }
}

/// A stored habit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Habit {
    pub habit_id: Uuid,
    pub user_id: Uuid,
    pub status: HabitStatus,
    pub effects: serde_json::Value,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub schedulers_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./pantrybot.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let schedulers_enabled = std::env::var("SCHEDULERS_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        Ok(Self {
            database_path,
            port,
            schedulers_enabled,
        })
    }
}
