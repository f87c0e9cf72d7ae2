//! Result-routing decisions
//!
//! Pure matching logic for `on_result` tables, kept separate from the
//! engine so the tie-break rules stay easy to pin down in tests.

use crate::core::StepResultAction;
use std::collections::BTreeMap;

/// Normalize an output value for matching
pub fn normalize(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Find the action bound to a step's outputs, if any
///
/// Traversal is outputs first, then table, both in key order; the first
/// hit wins. A value matches a table key either normalized (trim +
/// uppercase on both sides) or verbatim after trimming, so `"pass"`
/// outputs hit a `"PASS"` rule and case-sensitive literals keep working.
/// First-match, never best-match: the traversal order is part of the
/// contract.
pub fn match_result<'a>(
    outputs: &BTreeMap<String, String>,
    table: &'a BTreeMap<String, StepResultAction>,
) -> Option<(&'a String, &'a StepResultAction)> {
    for value in outputs.values() {
        let normalized = normalize(value);
        for (expected, action) in table {
            if normalized == normalize(expected) || value.trim() == expected.trim() {
                return Some((expected, action));
            }
        }
    }
    None
}
