use roomsync_core::{Direction, EngineError, EventKey, FragmentBoundaryEntry, TimelineEntry};
use roomsync_store::{StoreName, Transaction};

use crate::storage::{events, fragments};

/// Stores a timeline read needs.
pub(crate) const READ_STORES: [StoreName; 2] =
    [StoreName::TimelineEvents, StoreName::TimelineFragments];

/// Read up to `amount` events next to `from` in `direction`.
///
/// The walk continues into linked fragments only across edges without a gap,
/// emitting the boundaries it passes. Boundaries do not count towards
/// `amount`. Entries come back in ascending order.
pub(crate) fn read_from(
    txn: &dyn Transaction,
    room_id: &str,
    from: EventKey,
    direction: Direction,
    amount: usize,
) -> Result<Vec<TimelineEntry>, EngineError> {
    let mut collected: Vec<TimelineEntry> = Vec::new();
    if amount == 0 {
        return Ok(collected);
    }

    let mut fragment = fragments::require(txn, room_id, from.fragment_id)?;
    let mut position = from;
    let mut remaining = amount;
    loop {
        let page = match direction {
            Direction::Backward => {
                let mut page = events::before(txn, room_id, position, remaining)?;
                page.reverse();
                page
            }
            Direction::Forward => events::after(txn, room_id, position, remaining)?,
        };
        remaining -= page.len();
        collected.extend(page.into_iter().map(TimelineEntry::from));
        if remaining == 0 {
            break;
        }

        let edge = match direction {
            Direction::Backward => FragmentBoundaryEntry::start(fragment.clone()),
            Direction::Forward => FragmentBoundaryEntry::end(fragment.clone()),
        };
        if position != edge.key() && !(edge.direction().is_forward() && fragment.is_live()) {
            collected.push(edge.clone().into());
        }
        match edge.linked_fragment_id() {
            Some(neighbour_id) if !edge.has_gap() => {
                let neighbour = fragments::require(txn, room_id, neighbour_id)?;
                let entry = edge.neighbour_entry(neighbour.clone());
                position = entry.key();
                collected.push(entry.into());
                fragment = neighbour;
            }
            _ => break,
        }
    }

    if direction == Direction::Backward {
        collected.reverse();
    }
    Ok(collected)
}
