//! Turns raw inventory-log rows into the two events the predictor core
//! understands, including the note-keyword protocol (English and Hebrew)
//! and tolerant timestamp parsing.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::models::{
    FeedbackKind, InventoryAction, InventoryLogRow, InventorySource, InventoryState,
};

/// A purchase opens a new consumption cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseEvent {
    pub ts: DateTime<Utc>,
    pub source: InventorySource,
}

/// User feedback about the current stock level.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEvent {
    pub ts: DateTime<Utc>,
    pub kind: FeedbackKind,
    pub source: InventorySource,
    /// Free-text reason, inspected for WASTED events.
    pub note: Option<String>,
}

/// Why a product was thrown out, parsed from the free-text reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasteReason {
    /// "ran out" / "empty": the product was actually consumed, so the cycle
    /// length still carries (weak) signal.
    RanOut,
    /// Taste, expiry, or anything unrecognized: not a real consumption cycle.
    NotConsumed,
}

impl WasteReason {
    pub fn classify(note: Option<&str>) -> Self {
        let Some(note) = note else {
            return WasteReason::NotConsumed;
        };
        let low = note.to_lowercase();
        if low.contains("ran out") || low.contains("empty") || low.contains("נגמר") {
            WasteReason::RanOut
        } else {
            WasteReason::NotConsumed
        }
    }
}

/// Parse a log note into a feedback kind.
///
/// Accepts JSON (`{"feedback_kind": "MORE"}`, `kind` also recognized) and
/// plain text containing English or Hebrew keywords.
pub fn parse_feedback_from_note(note: Option<&str>) -> Option<FeedbackKind> {
    let s = note?.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(obj) = serde_json::from_str::<serde_json::Value>(s) {
        if let Some(kind) = obj
            .get("feedback_kind")
            .or_else(|| obj.get("kind"))
            .and_then(|v| v.as_str())
        {
            if let Some(parsed) = FeedbackKind::from_str(kind) {
                return Some(parsed);
            }
        }
    }

    let low = s.to_lowercase();
    if low.contains("wasted") || low.contains("thrown") || low.contains("נזרק") {
        return Some(FeedbackKind::Wasted);
    }
    if low.contains("empty") || low.contains("out") || low.contains("נגמר") {
        return Some(FeedbackKind::Empty);
    }
    if low.contains("exact") || low.contains("בול") {
        return Some(FeedbackKind::Exact);
    }
    if low.contains("more") || low.contains("יותר") {
        return Some(FeedbackKind::More);
    }
    if low.contains("less") || low.contains("פחות") {
        return Some(FeedbackKind::Less);
    }
    None
}

/// Classify a log row into at most one purchase and one feedback event.
///
/// PURCHASE/RESET/REPURCHASE are purchases; ADJUST rows carry their meaning
/// in the note; EMPTY/TRASH actions imply the matching feedback; a bare
/// delta_state of EMPTY or FULL is the last resort.
pub fn classify_log_row(
    row: &InventoryLogRow,
) -> (Option<PurchaseEvent>, Option<FeedbackEvent>) {
    let purchase = |ts| PurchaseEvent {
        ts,
        source: row.source,
    };
    let feedback = |kind| FeedbackEvent {
        ts: row.occurred_at,
        kind,
        source: row.source,
        note: row.note.clone(),
    };

    match row.action {
        InventoryAction::Purchase | InventoryAction::Reset | InventoryAction::Repurchase => {
            return (Some(purchase(row.occurred_at)), None);
        }
        _ => {}
    }

    if let Some(kind) = parse_feedback_from_note(row.note.as_deref()) {
        return (None, Some(feedback(kind)));
    }

    match row.action {
        InventoryAction::Empty => return (None, Some(feedback(FeedbackKind::Empty))),
        InventoryAction::Trash => return (None, Some(feedback(FeedbackKind::Wasted))),
        _ => {}
    }

    match row.delta_state {
        Some(InventoryState::Empty) => (None, Some(feedback(FeedbackKind::Empty))),
        Some(InventoryState::Full) => (Some(purchase(row.occurred_at)), None),
        _ => (None, None),
    }
}

/// Parse a stored timestamp. Storage layers return RFC 3339 with either a
/// `Z` or an offset suffix and variable sub-second precision; naive strings
/// are taken as UTC.
pub fn parse_utc_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    Err(anyhow!("unparseable timestamp: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn row(
        action: InventoryAction,
        note: Option<&str>,
        delta_state: Option<InventoryState>,
    ) -> InventoryLogRow {
        InventoryLogRow {
            log_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            action,
            delta_state,
            action_confidence: 1.0,
            occurred_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
            source: InventorySource::Manual,
            note: note.map(|s| s.to_string()),
            receipt_item_id: None,
            shopping_list_item_id: None,
        }
    }

    #[test]
    fn test_note_parsing_json_and_keywords() {
        assert_eq!(
            parse_feedback_from_note(Some(r#"{"feedback_kind": "MORE"}"#)),
            Some(FeedbackKind::More)
        );
        assert_eq!(
            parse_feedback_from_note(Some(r#"{"kind": "wasted"}"#)),
            Some(FeedbackKind::Wasted)
        );
        assert_eq!(
            parse_feedback_from_note(Some("EMPTY: ran out")),
            Some(FeedbackKind::Empty)
        );
        assert_eq!(
            parse_feedback_from_note(Some("User feedback: Less stock needed")),
            Some(FeedbackKind::Less)
        );
        assert_eq!(parse_feedback_from_note(Some("נגמר")), Some(FeedbackKind::Empty));
        assert_eq!(parse_feedback_from_note(Some("נזרק לפח")), Some(FeedbackKind::Wasted));
        assert_eq!(parse_feedback_from_note(Some("יותר")), Some(FeedbackKind::More));
        assert_eq!(parse_feedback_from_note(Some("just a remark")), None);
        assert_eq!(parse_feedback_from_note(None), None);
        assert_eq!(parse_feedback_from_note(Some("   ")), None);
    }

    #[test]
    fn test_purchase_actions_classify_as_purchase() {
        for action in [
            InventoryAction::Purchase,
            InventoryAction::Reset,
            InventoryAction::Repurchase,
        ] {
            let (purchase, feedback) = classify_log_row(&row(action, None, None));
            assert!(purchase.is_some(), "{action:?} should be a purchase");
            assert!(feedback.is_none());
        }
    }

    #[test]
    fn test_adjust_with_note_is_feedback() {
        let (purchase, feedback) =
            classify_log_row(&row(InventoryAction::Adjust, Some("more please"), None));
        assert!(purchase.is_none());
        assert_eq!(feedback.unwrap().kind, FeedbackKind::More);
    }

    #[test]
    fn test_empty_and_trash_actions_without_note() {
        let (_, feedback) = classify_log_row(&row(InventoryAction::Empty, None, None));
        assert_eq!(feedback.unwrap().kind, FeedbackKind::Empty);

        let (_, feedback) = classify_log_row(&row(InventoryAction::Trash, None, None));
        assert_eq!(feedback.unwrap().kind, FeedbackKind::Wasted);
    }

    #[test]
    fn test_delta_state_fallback() {
        let (purchase, feedback) =
            classify_log_row(&row(InventoryAction::Adjust, None, Some(InventoryState::Empty)));
        assert!(purchase.is_none());
        assert_eq!(feedback.unwrap().kind, FeedbackKind::Empty);

        let (purchase, feedback) =
            classify_log_row(&row(InventoryAction::Adjust, None, Some(InventoryState::Full)));
        assert!(purchase.is_some());
        assert!(feedback.is_none());

        let (purchase, feedback) = classify_log_row(&row(InventoryAction::Adjust, None, None));
        assert!(purchase.is_none() && feedback.is_none());
    }

    #[test]
    fn test_waste_reason_classification() {
        assert_eq!(
            WasteReason::classify(Some("WASTED: ran out")),
            WasteReason::RanOut
        );
        assert_eq!(WasteReason::classify(Some("it was EMPTY")), WasteReason::RanOut);
        assert_eq!(WasteReason::classify(Some("נגמר")), WasteReason::RanOut);
        assert_eq!(
            WasteReason::classify(Some("taste bad")),
            WasteReason::NotConsumed
        );
        assert_eq!(
            WasteReason::classify(Some("expired last week")),
            WasteReason::NotConsumed
        );
        assert_eq!(WasteReason::classify(None), WasteReason::NotConsumed);
    }

    #[test]
    fn test_timestamp_parsing_tolerance() {
        let expect = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 15).unwrap();

        for s in [
            "2025-03-01T09:30:15Z",
            "2025-03-01T09:30:15+00:00",
            "2025-03-01T09:30:15.000Z",
            "2025-03-01T09:30:15.1234Z",
            "2025-03-01T09:30:15.123456+00:00",
            "2025-03-01T09:30:15",
            "2025-03-01 09:30:15",
            "  2025-03-01T09:30:15Z  ",
        ] {
            let parsed = parse_utc_timestamp(s).unwrap();
            assert_eq!(parsed.timestamp(), expect.timestamp(), "failed on {s:?}");
        }

        // offsets are normalized to UTC
        let offset = parse_utc_timestamp("2025-03-01T11:30:15+02:00").unwrap();
        assert_eq!(offset, expect);

        assert!(parse_utc_timestamp("not a time").is_err());
    }
}
