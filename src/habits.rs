//! Habit multiplier resolution.
//!
//! Active habits contribute global, per-product, and per-category
//! consumption multipliers. They compose by multiplication into one scalar
//! per (user, product); a multiplier > 1 means faster consumption, so it
//! divides days_left at prediction time.

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::HabitEffects;
use crate::predictor::cycle::EPS;

/// Compose the multiplier of a single habit's effects for one product.
/// Missing fields contribute 1.0.
pub fn contributed_multiplier(
    effects: &HabitEffects,
    product_id: Uuid,
    category_id: Option<Uuid>,
) -> f64 {
    let mut mult = 1.0;
    if let Some(global) = effects.global_multiplier {
        mult *= global;
    }
    if let Some(per_product) = effects.product_multipliers.get(&product_id) {
        mult *= per_product;
    }
    if let Some(category_id) = category_id {
        if let Some(per_category) = effects.category_multipliers.get(&category_id) {
            mult *= per_category;
        }
    }
    mult.max(EPS)
}

/// Compose all active habits into one multiplier for (product, category).
///
/// Malformed effects payloads are skipped with a warning; with no active
/// habits the result is exactly 1.0.
pub fn resolve_multiplier(
    effects_list: &[Value],
    product_id: Uuid,
    category_id: Option<Uuid>,
) -> f64 {
    let mut mult = 1.0;
    for raw in effects_list {
        let effects: HabitEffects = match serde_json::from_value(raw.clone()) {
            Ok(effects) => effects,
            Err(e) => {
                warn!("skipping malformed habit effects: {}", e);
                continue;
            }
        };
        mult *= contributed_multiplier(&effects, product_id, category_id);
    }
    mult.max(EPS)
}

/// Which of the user's inventory products a habit touches: everything for a
/// global multiplier, otherwise direct product ids plus category matches.
pub fn affected_products(
    effects: &HabitEffects,
    inventory: &[(Uuid, Option<Uuid>)],
) -> Vec<(Uuid, Option<Uuid>)> {
    if effects.global_multiplier.is_some() {
        return inventory.to_vec();
    }

    inventory
        .iter()
        .filter(|(product_id, category_id)| {
            effects.product_multipliers.contains_key(product_id)
                || category_id
                    .map(|c| effects.category_multipliers.contains_key(&c))
                    .unwrap_or(false)
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn effects(
        global: Option<f64>,
        products: &[(Uuid, f64)],
        categories: &[(Uuid, f64)],
    ) -> HabitEffects {
        HabitEffects {
            global_multiplier: global,
            product_multipliers: products.iter().copied().collect::<HashMap<_, _>>(),
            category_multipliers: categories.iter().copied().collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_no_habits_is_identity() {
        let product = Uuid::new_v4();
        assert_eq!(resolve_multiplier(&[], product, None), 1.0);
    }

    #[test]
    fn test_multipliers_compose_across_habits() {
        let product = Uuid::new_v4();
        let category = Uuid::new_v4();

        let a = serde_json::to_value(effects(Some(2.0), &[], &[])).unwrap();
        let b = serde_json::to_value(effects(None, &[(product, 1.5)], &[(category, 0.5)])).unwrap();

        let mult = resolve_multiplier(&[a, b], product, Some(category));
        assert!((mult - 2.0 * 1.5 * 0.5).abs() < 1e-12);

        // other products only see the global effect
        let other = resolve_multiplier(
            &[
                serde_json::to_value(effects(Some(2.0), &[], &[])).unwrap(),
                serde_json::to_value(effects(None, &[(product, 1.5)], &[])).unwrap(),
            ],
            Uuid::new_v4(),
            None,
        );
        assert!((other - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_malformed_effects_are_skipped() {
        let product = Uuid::new_v4();
        let good = serde_json::to_value(effects(Some(3.0), &[], &[])).unwrap();
        let bad = serde_json::json!({"product_multipliers": "not-a-map"});

        let mult = resolve_multiplier(&[bad, good], product, None);
        assert!((mult - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_multiplier_floor() {
        let product = Uuid::new_v4();
        let zeroing = serde_json::to_value(effects(Some(0.0), &[], &[])).unwrap();
        let mult = resolve_multiplier(&[zeroing], product, None);
        assert!(mult >= EPS);
    }

    #[test]
    fn test_affected_products() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let p3 = Uuid::new_v4();
        let cat = Uuid::new_v4();
        let inventory = vec![(p1, None), (p2, Some(cat)), (p3, None)];

        let global = effects(Some(1.2), &[], &[]);
        assert_eq!(affected_products(&global, &inventory).len(), 3);

        let targeted = effects(None, &[(p1, 2.0)], &[(cat, 1.5)]);
        let affected = affected_products(&targeted, &inventory);
        assert_eq!(affected.len(), 2);
        assert!(affected.iter().any(|(id, _)| *id == p1));
        assert!(affected.iter().any(|(id, _)| *id == p2));
    }
}
