//! Predictor tunables, persisted per-user as the active profile's config JSON.
//!
//! Unknown keys are ignored, values are coerced to float where possible, and
//! anything missing falls back to the defaults below.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Cold-start prior for a product category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryPrior {
    pub mean_days: f64,
    pub mad_days: f64,
}

/// Fallback prior for unknown categories.
pub const DEFAULT_PRIOR: CategoryPrior = CategoryPrior {
    mean_days: 7.0,
    mad_days: 2.0,
};

#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub category_priors: HashMap<Uuid, CategoryPrior>,

    // EMA weights
    pub alpha_strong: f64,
    pub alpha_weak: f64,
    pub alpha_confirm: f64,

    // cycle bounds
    pub min_cycle_days: f64,
    pub max_cycle_days: f64,

    // MORE/LESS shaping
    pub more_less_ratio: f64,
    pub more_less_step_cap_days: f64,

    // state thresholds by ratio of days_left / mean
    pub full_ratio: f64,
    pub medium_ratio: f64,

    // confidence shaping
    pub recency_tau_days: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            category_priors: HashMap::new(),
            alpha_strong: 0.12,
            alpha_weak: 0.10,
            alpha_confirm: 0.05,
            min_cycle_days: 1.0,
            max_cycle_days: 90.0,
            more_less_ratio: 0.15,
            more_less_step_cap_days: 3.0,
            full_ratio: 0.70,
            medium_ratio: 0.30,
            recency_tau_days: 21.0,
        }
    }
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

impl PredictorConfig {
    /// Parse the persisted profile config JSON.
    pub fn from_profile_json(cfg: &Value) -> Self {
        let mut out = PredictorConfig::default();

        let Some(obj) = cfg.as_object() else {
            return out;
        };

        if let Some(priors) = obj.get("category_priors").and_then(Value::as_object) {
            for (key, raw) in priors {
                let Ok(category_id) = Uuid::parse_str(key) else {
                    continue;
                };
                let mean = raw.get("mean_days").and_then(coerce_f64);
                let mad = raw.get("mad_days").and_then(coerce_f64);
                out.category_priors.insert(
                    category_id,
                    CategoryPrior {
                        mean_days: mean.unwrap_or(DEFAULT_PRIOR.mean_days),
                        mad_days: mad.unwrap_or(DEFAULT_PRIOR.mad_days),
                    },
                );
            }
        }

        let set = |key: &str, slot: &mut f64| {
            if let Some(v) = obj.get(key).and_then(coerce_f64) {
                *slot = v;
            }
        };
        set("alpha_strong", &mut out.alpha_strong);
        set("alpha_weak", &mut out.alpha_weak);
        set("alpha_confirm", &mut out.alpha_confirm);
        set("min_cycle_days", &mut out.min_cycle_days);
        set("max_cycle_days", &mut out.max_cycle_days);
        set("more_less_ratio", &mut out.more_less_ratio);
        set("more_less_step_cap_days", &mut out.more_less_step_cap_days);
        set("full_ratio", &mut out.full_ratio);
        set("medium_ratio", &mut out.medium_ratio);
        set("recency_tau_days", &mut out.recency_tau_days);

        out
    }

    /// Prior for a category, falling back to (7.0, 2.0).
    pub fn prior_for(&self, category_id: Option<Uuid>) -> CategoryPrior {
        category_id
            .and_then(|id| self.category_priors.get(&id).copied())
            .unwrap_or(DEFAULT_PRIOR)
    }
}

/// Seed priors by category name, used when the default profile is lazily
/// created. Fast movers (bread, fish) versus long-shelf staples.
pub fn default_priors_by_name() -> &'static [(&'static str, CategoryPrior)] {
    static PRIORS: &[(&str, CategoryPrior)] = &[
        ("Dairy & Eggs", CategoryPrior { mean_days: 5.0, mad_days: 2.0 }),
        ("Bread & Bakery", CategoryPrior { mean_days: 4.0, mad_days: 1.5 }),
        ("Meat & Poultry", CategoryPrior { mean_days: 4.0, mad_days: 2.0 }),
        ("Fish & Seafood", CategoryPrior { mean_days: 3.0, mad_days: 1.5 }),
        ("Fruits", CategoryPrior { mean_days: 6.0, mad_days: 2.5 }),
        ("Vegetables", CategoryPrior { mean_days: 5.0, mad_days: 2.0 }),
        ("Grains & Pasta", CategoryPrior { mean_days: 35.0, mad_days: 10.0 }),
        ("Canned & Jarred", CategoryPrior { mean_days: 75.0, mad_days: 15.0 }),
        ("Condiments & Sauces", CategoryPrior { mean_days: 45.0, mad_days: 15.0 }),
        ("Snacks", CategoryPrior { mean_days: 10.0, mad_days: 5.0 }),
        ("Beverages", CategoryPrior { mean_days: 7.0, mad_days: 3.0 }),
        ("Frozen Foods", CategoryPrior { mean_days: 45.0, mad_days: 15.0 }),
        ("Spices & Seasonings", CategoryPrior { mean_days: 75.0, mad_days: 20.0 }),
    ];
    PRIORS
}

/// Build the config JSON stored on a freshly created default profile.
///
/// `categories` maps every known category id to its name; each gets a seed
/// prior by case-insensitive name match.
pub fn default_profile_config_json(categories: &[(Uuid, String)]) -> Value {
    let mut priors = serde_json::Map::new();
    for (category_id, name) in categories {
        let prior = default_priors_by_name()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, p)| *p)
            .unwrap_or(DEFAULT_PRIOR);
        priors.insert(
            category_id.to_string(),
            serde_json::json!({ "mean_days": prior.mean_days, "mad_days": prior.mad_days }),
        );
    }

    let defaults = PredictorConfig::default();
    serde_json::json!({
        "category_priors": priors,
        "alpha_strong": defaults.alpha_strong,
        "alpha_weak": defaults.alpha_weak,
        "alpha_confirm": defaults.alpha_confirm,
        "min_cycle_days": defaults.min_cycle_days,
        "max_cycle_days": defaults.max_cycle_days,
        "more_less_ratio": defaults.more_less_ratio,
        "more_less_step_cap_days": defaults.more_less_step_cap_days,
        "full_ratio": defaults.full_ratio,
        "medium_ratio": defaults.medium_ratio,
        "recency_tau_days": defaults.recency_tau_days,
    })
}
