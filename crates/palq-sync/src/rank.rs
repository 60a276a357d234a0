use std::cmp::Ordering;

use palq_core::{PreviousStateMap, WorkQueueItem};

/// Unions both item sets, re-attaches carried-over claim state and sorts
/// most urgent first.
///
/// Equal scores fall back to identifier, then location, so a rebuild from
/// unchanged inputs always produces the same row order.
pub fn merge_and_rank(
    source: Vec<WorkQueueItem>,
    manual: Vec<WorkQueueItem>,
    previous: &PreviousStateMap,
) -> Vec<WorkQueueItem> {
    let mut items = source
        .into_iter()
        .chain(manual)
        .map(|mut item| {
            if let Some(claim) = previous.get(&item.id) {
                item.claim = claim.clone();
            }
            item.claim.claimed = item.claim.is_claimed();
            item
        })
        .collect::<Vec<_>>();
    items.sort_by(rank_order);
    items
}

fn rank_order(a: &WorkQueueItem, b: &WorkQueueItem) -> Ordering {
    a.hours_remaining
        .total_cmp(&b.hours_remaining)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.location.cmp(&b.location))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palq_core::{Cell, ClaimState};

    fn item(id: &str, hours: f64) -> WorkQueueItem {
        WorkQueueItem {
            id: id.to_string(),
            location: "LINE-1".to_string(),
            hours_remaining: hours,
            kind: String::new(),
            shift: String::new(),
            origin: "Line 1".to_string(),
            claim: ClaimState::default(),
        }
    }

    #[test]
    fn sorts_ascending_with_identifier_tie_break() {
        let ranked = merge_and_rank(
            vec![item("B", 3.0), item("C", -2.0), item("A", 3.0)],
            vec![item("M", -9999.0)],
            &PreviousStateMap::new(),
        );
        let ids = ranked.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["M", "C", "A", "B"]);
    }

    #[test]
    fn carried_claims_set_the_derived_flag() {
        let mut previous = PreviousStateMap::new();
        previous.insert(
            "A".into(),
            ClaimState {
                arrival_time: Cell::text("09:10"),
                claimed: false,
                ..ClaimState::default()
            },
        );
        previous.insert(
            "B".into(),
            ClaimState {
                claimed: true,
                ..ClaimState::default()
            },
        );
        let ranked = merge_and_rank(vec![item("A", 1.0), item("B", 2.0)], vec![], &previous);
        assert!(ranked[0].claim.claimed);
        assert_eq!(ranked[0].claim.arrival_time, Cell::text("09:10"));
        assert!(!ranked[1].claim.claimed);
    }
}
