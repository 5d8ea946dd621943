//! Price alert data model and crossing predicate.

pub mod engine;
pub mod store;

use crate::exchange::{ExchangeId, Market};
use crate::symbol::CanonicalSymbol;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Above,
    Below,
}

impl Condition {
    /// Never trust a stored condition for an alert with a valid
    /// `initial_price` — always re-derive it.
    pub fn derive(initial_price: f64, target_value: f64) -> Self {
        if initial_price > target_value {
            Condition::Below
        } else {
            Condition::Above
        }
    }
}

/// Only the fields the core reads or writes; the durable record (owned by
/// the out-of-scope CRUD surface) may carry more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub exchange: ExchangeId,
    pub market: Market,
    pub symbol: CanonicalSymbol,
    pub target_value: f64,
    pub initial_price: Option<f64>,
    pub active: bool,
    pub triggered: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `ε = max(|target|·1e-4, 1e-8)`.
pub fn epsilon(target_value: f64) -> f64 {
    (target_value.abs() * 1e-4).max(1e-8)
}

/// `|initial − target| ≤ ε` is an invalid creation — preserved verbatim as
/// the boundary for "equality to target at creation", per the open question
/// on this exact check.
pub fn is_invalid_snapshot(initial_price: f64, target_value: f64) -> bool {
    initial_price <= 0.0 || (initial_price - target_value).abs() <= epsilon(target_value)
}

/// `hasReached(previous, current, target, condition)`.
pub fn has_reached(previous: f64, current: f64, target_value: f64, condition: Condition) -> bool {
    let eps = epsilon(target_value);
    match condition {
        Condition::Above => previous < target_value - eps && current >= target_value - eps,
        Condition::Below => previous > target_value + eps && current <= target_value + eps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_picks_below_when_initial_above_target() {
        assert_eq!(Condition::derive(100.0, 99.0), Condition::Below);
        assert_eq!(Condition::derive(99.0, 100.0), Condition::Above);
    }

    #[test]
    fn invalid_snapshot_catches_equality_within_epsilon() {
        assert!(is_invalid_snapshot(100.0, 100.0));
        assert!(is_invalid_snapshot(0.0, 100.0));
        assert!(!is_invalid_snapshot(99.0, 100.0));
    }

    #[test]
    fn has_reached_upward_crossing() {
        assert!(!has_reached(99.5, 99.9, 101.0, Condition::Above));
        assert!(has_reached(100.0, 101.0, 101.0, Condition::Above));
    }

    #[test]
    fn has_reached_downward_crossing() {
        assert!(has_reached(101.0, 99.0, 100.0, Condition::Below));
        assert!(!has_reached(99.0, 98.0, 100.0, Condition::Below));
    }

    #[test]
    fn wrong_side_at_creation_never_fires() {
        // initial already past target on the "above" side never satisfies
        // the below branch, and vice versa — guards against the
        // anti-false-positive requirement.
        let target = 100.0;
        let initial = 101.0; // condition derives to Below
        let condition = Condition::derive(initial, target);
        assert_eq!(condition, Condition::Below);
        assert!(!has_reached(initial, 105.0, target, condition));
    }
}
