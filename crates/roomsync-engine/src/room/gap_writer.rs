//! Writes a backfilled page of history into the fragment that asked for it.
//!
//! The page is checked for overlap with already stored events. Overlap means
//! the requesting fragment touches another one, and the two get linked.

use std::{collections::HashMap, sync::Mutex};

use roomsync_core::{
    Direction, EngineError, EventEntry, EventKey, Fragment, FragmentBoundaryEntry,
    MessagesResponse, RawEvent,
};
use roomsync_store::Transaction;
use tracing::{debug, info, warn};

use super::{
    members::{MemberCache, RoomMember},
    sync_writer::{TimelineWriteResult, resolve_sender, validate_event},
};
use crate::{
    crypto::DecryptionResults,
    storage::{events, fragments, members},
};

/// Where the page in `response` came from.
#[derive(Debug)]
pub(crate) struct GapFill<'a> {
    pub boundary: &'a FragmentBoundaryEntry,
    /// Token the page was requested with.
    pub token: &'a str,
    pub response: &'a MessagesResponse,
}

pub(crate) struct GapWriter<'a> {
    room_id: &'a str,
}

/// Outcome of scanning a page for already stored events.
struct Overlap {
    new_events: Vec<RawEvent>,
    neighbour_fragment_id: Option<u32>,
}

impl<'a> GapWriter<'a> {
    pub(crate) fn new(room_id: &'a str) -> Self {
        Self { room_id }
    }

    pub(crate) fn write_fragment_fill(
        &self,
        txn: &mut dyn Transaction,
        fill: GapFill<'_>,
        decryption: &DecryptionResults,
        cache: &Mutex<MemberCache>,
    ) -> Result<TimelineWriteResult, EngineError> {
        let room_id = self.room_id;
        let direction = fill.boundary.direction();
        let mut fragment = fragments::require(txn, room_id, fill.boundary.fragment_id())?;
        if fragment.token(direction) != Some(fill.token) {
            return Err(EngineError::consistency(
                "stale_gap_token",
                format!(
                    "fragment {} of {room_id} no longer has token {} on its {:?} edge",
                    fragment.id, fill.token, direction
                ),
            ));
        }

        let mut result = TimelineWriteResult::default();
        if fill.response.chunk.is_empty() {
            fragment.set_token(direction, None);
            fragment.set_edge_reached(direction, true);
            fragments::put(txn, &fragment)?;
            info!(room_id, fragment_id = fragment.id, ?direction, "reached edge of room history");
            push_boundary(&mut result, &fragment, fill.boundary.is_start);
            result.fragments.push(fragment);
            return Ok(result);
        }

        let overlap = self.find_overlap(txn, &fragment, direction, &fill.response.chunk)?;
        let page_members = self.store_page_members(txn, &fill.response.state)?;
        self.insert_events(
            txn,
            &fragment,
            direction,
            &overlap.new_events,
            &page_members,
            decryption,
            cache,
            &mut result,
        )?;

        match overlap.neighbour_fragment_id {
            Some(neighbour_id) if neighbour_id == fragment.id => {
                warn!(
                    room_id,
                    fragment_id = fragment.id,
                    "page overlaps its own fragment, dropping the gap token"
                );
                fragment.set_token(direction, None);
                fragments::put(txn, &fragment)?;
                push_boundary(&mut result, &fragment, fill.boundary.is_start);
                result.fragments.push(fragment);
            }
            Some(neighbour_id) => {
                let mut neighbour = fragments::require(txn, room_id, neighbour_id)?;
                link(&mut fragment, &mut neighbour, direction)?;
                fragments::put(txn, &fragment)?;
                fragments::put(txn, &neighbour)?;
                info!(
                    room_id,
                    fragment_id = fragment.id,
                    neighbour_id,
                    "linked fragments after backfill"
                );
                push_boundary(&mut result, &fragment, fill.boundary.is_start);
                push_boundary(&mut result, &neighbour, !fill.boundary.is_start);
                result.fragments.push(fragment);
                result.fragments.push(neighbour);
            }
            None => {
                fragment.set_token(direction, fill.response.end.clone());
                if fill.response.end.is_none() {
                    fragment.set_edge_reached(direction, true);
                }
                fragments::put(txn, &fragment)?;
                push_boundary(&mut result, &fragment, fill.boundary.is_start);
                result.fragments.push(fragment);
            }
        }
        result.members = page_members.into_values().collect();
        Ok(result)
    }

    /// Split the page at the first event that is already stored.
    fn find_overlap(
        &self,
        txn: &dyn Transaction,
        fragment: &Fragment,
        direction: Direction,
        chunk: &[RawEvent],
    ) -> Result<Overlap, EngineError> {
        let expected_edge_event = match fragment.linked_id(direction) {
            Some(linked_id) => self.edge_event_id(txn, linked_id, direction)?,
            None => None,
        };
        let already_linked = fragment.linked_id(direction).is_some();

        let mut new_events = Vec::new();
        for event in chunk {
            let Some(existing) = events::key_for_event_id(txn, self.room_id, &event.event_id)?
            else {
                new_events.push(event.clone());
                continue;
            };
            if already_linked && expected_edge_event.as_deref() != Some(event.event_id.as_str()) {
                debug!(
                    room_id = self.room_id,
                    event_id = %event.event_id,
                    "skipping stored event that is not the neighbour's edge"
                );
                continue;
            }
            return Ok(Overlap {
                new_events,
                neighbour_fragment_id: Some(existing.fragment_id),
            });
        }
        Ok(Overlap {
            new_events,
            neighbour_fragment_id: None,
        })
    }

    /// The event of `neighbour_id` that faces the requesting fragment.
    fn edge_event_id(
        &self,
        txn: &dyn Transaction,
        neighbour_id: u32,
        direction: Direction,
    ) -> Result<Option<String>, EngineError> {
        let edge = match direction {
            Direction::Backward => events::last_in_fragment(txn, self.room_id, neighbour_id)?,
            Direction::Forward => events::first_in_fragment(txn, self.room_id, neighbour_id)?,
        };
        Ok(edge.map(|entry| entry.event.event_id))
    }

    /// Members from the page's state, stored only for users not yet known.
    fn store_page_members(
        &self,
        txn: &mut dyn Transaction,
        state: &[RawEvent],
    ) -> Result<HashMap<String, RoomMember>, EngineError> {
        let mut page_members = HashMap::new();
        for event in state {
            let Some(member) = RoomMember::from_member_event(self.room_id, event) else {
                continue;
            };
            if members::get(txn, self.room_id, &member.user_id)?.is_none() {
                members::set(txn, &member)?;
            }
            page_members.insert(member.user_id.clone(), member);
        }
        Ok(page_members)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_events(
        &self,
        txn: &mut dyn Transaction,
        fragment: &Fragment,
        direction: Direction,
        new_events: &[RawEvent],
        page_members: &HashMap<String, RoomMember>,
        decryption: &DecryptionResults,
        cache: &Mutex<MemberCache>,
        result: &mut TimelineWriteResult,
    ) -> Result<(), EngineError> {
        let room_id = self.room_id;
        let mut current = self.edge_key(txn, fragment.id, direction)?;
        for event in new_events {
            validate_event(event)?;
            if events::key_for_event_id(txn, room_id, &event.event_id)?.is_some() {
                continue;
            }
            let key = current.next_key_for_direction(direction).ok_or_else(|| {
                EngineError::consistency(
                    "fragment_full",
                    format!("no key left {direction:?} of {current} in {room_id}"),
                )
            })?;

            let mut entry = EventEntry::new(room_id, key, event.clone());
            entry.decryption = decryption.get(&event.event_id).cloned();
            if let Some(sender) = resolve_sender(txn, room_id, &event.sender, page_members, cache)? {
                entry.display_name = sender.display_name;
                entry.avatar_url = sender.avatar_url;
            }
            events::insert(txn, &entry)?;
            result.entries.push(entry.into());
            current = key;
        }
        Ok(())
    }

    /// Key of the fragment's edge event, or the middle key when it is empty.
    fn edge_key(
        &self,
        txn: &dyn Transaction,
        fragment_id: u32,
        direction: Direction,
    ) -> Result<EventKey, EngineError> {
        let edge = match direction {
            Direction::Backward => events::first_in_fragment(txn, self.room_id, fragment_id)?,
            Direction::Forward => events::last_in_fragment(txn, self.room_id, fragment_id)?,
        };
        Ok(edge.map_or_else(|| EventKey::default_fragment_key(fragment_id), |entry| entry.key))
    }
}

/// Link `fragment` to `neighbour` in `direction` and drop both gap tokens.
fn link(
    fragment: &mut Fragment,
    neighbour: &mut Fragment,
    direction: Direction,
) -> Result<(), EngineError> {
    if fragment.id == neighbour.id {
        return Err(EngineError::consistency(
            "self_link",
            format!("fragment {} cannot link to itself", fragment.id),
        ));
    }
    let reverse = direction.reverse();
    for (from, existing, to) in [
        (fragment.id, fragment.linked_id(direction), neighbour.id),
        (neighbour.id, neighbour.linked_id(reverse), fragment.id),
    ] {
        if existing.is_some_and(|id| id != to) {
            return Err(EngineError::consistency(
                "conflicting_link",
                format!("fragment {from} is already linked elsewhere, refusing to link it to {to}"),
            ));
        }
    }

    fragment.set_linked_id(direction, Some(neighbour.id));
    fragment.set_token(direction, None);
    neighbour.set_linked_id(reverse, Some(fragment.id));
    neighbour.set_token(reverse, None);
    Ok(())
}

fn push_boundary(result: &mut TimelineWriteResult, fragment: &Fragment, is_start: bool) {
    let boundary = if is_start {
        FragmentBoundaryEntry::start(fragment.clone())
    } else {
        FragmentBoundaryEntry::end(fragment.clone())
    };
    result.updated.push(boundary.into());
}

#[cfg(test)]
mod tests {
    use roomsync_core::{MIDDLE_INDEX, TimelineEntry};
    use roomsync_store::{MemoryStorage, Storage, StoreName};
    use serde_json::json;

    use super::*;

    const ROOM: &str = "!room:example.org";

    fn event(id: &str) -> RawEvent {
        RawEvent {
            event_id: id.into(),
            event_type: "m.room.message".into(),
            sender: "@alice:example.org".into(),
            origin_server_ts: 1,
            content: json!({"body": id}),
            state_key: None,
            unsigned: None,
        }
    }

    fn store_event(txn: &mut dyn Transaction, fragment_id: u32, offset: u32, id: &str) {
        let entry = EventEntry::new(ROOM, EventKey::new(fragment_id, MIDDLE_INDEX + offset), event(id));
        events::insert(txn, &entry).expect("insert");
    }

    fn fill(
        txn: &mut dyn Transaction,
        fragment: &Fragment,
        token: &str,
        response: &MessagesResponse,
    ) -> Result<TimelineWriteResult, EngineError> {
        let boundary = FragmentBoundaryEntry::start(fragment.clone());
        GapWriter::new(ROOM).write_fragment_fill(
            txn,
            GapFill {
                boundary: &boundary,
                token,
                response,
            },
            &DecryptionResults::new(),
            &Mutex::new(MemberCache::new(4)),
        )
    }

    /// Fragment 0 holds `$1..$3`; fragment 1 is live with a backward gap.
    async fn split_room(storage: &MemoryStorage) -> (Box<dyn Transaction>, Fragment) {
        let mut txn = storage
            .read_write_txn(&StoreName::ALL)
            .await
            .expect("open");
        let mut old = Fragment::new_live(ROOM, 0, None);
        old.next_token = Some("s1".into());
        fragments::put(txn.as_mut(), &old).expect("put");
        for (offset, id) in [(1, "$1"), (2, "$2"), (3, "$3")] {
            store_event(txn.as_mut(), 0, offset, id);
        }
        let mut live = Fragment::new_live(ROOM, 1, Some("p1".into()));
        live.start_reached = false;
        fragments::put(txn.as_mut(), &live).expect("put");
        store_event(txn.as_mut(), 1, 1, "$6");
        (txn, live)
    }

    #[tokio::test]
    async fn overlap_inserts_new_events_and_links_fragments() {
        let storage = MemoryStorage::new();
        let (mut txn, live) = split_room(&storage).await;
        let response = MessagesResponse {
            chunk: vec![event("$5"), event("$4"), event("$3"), event("$2")],
            start: "p1".into(),
            end: Some("p2".into()),
            state: Vec::new(),
        };

        let result = fill(txn.as_mut(), &live, "p1", &response).expect("fill");

        let inserted: Vec<_> = result
            .entries
            .iter()
            .filter_map(TimelineEntry::as_event)
            .map(|e| (e.event_id().to_owned(), e.key))
            .collect();
        assert_eq!(
            inserted,
            [
                ("$5".to_owned(), EventKey::new(1, MIDDLE_INDEX)),
                ("$4".to_owned(), EventKey::new(1, MIDDLE_INDEX - 1)),
            ]
        );

        let live = fragments::require(txn.as_ref(), ROOM, 1).expect("live");
        let old = fragments::require(txn.as_ref(), ROOM, 0).expect("old");
        assert_eq!(live.previous_id, Some(0));
        assert_eq!(live.previous_token, None);
        assert_eq!(old.next_id, Some(1));
        assert_eq!(old.next_token, None);
        assert_eq!(result.updated.len(), 2);
    }

    #[tokio::test]
    async fn empty_page_marks_start_reached() {
        let storage = MemoryStorage::new();
        let (mut txn, live) = split_room(&storage).await;
        let response = MessagesResponse {
            start: "p1".into(),
            ..MessagesResponse::default()
        };

        let result = fill(txn.as_mut(), &live, "p1", &response).expect("fill");

        assert!(result.entries.is_empty());
        let live = fragments::require(txn.as_ref(), ROOM, 1).expect("live");
        assert!(live.start_reached);
        assert_eq!(live.previous_token, None);
        assert_eq!(live.previous_id, None);
    }

    #[tokio::test]
    async fn page_without_overlap_keeps_end_token() {
        let storage = MemoryStorage::new();
        let (mut txn, live) = split_room(&storage).await;
        let response = MessagesResponse {
            chunk: vec![event("$5")],
            start: "p1".into(),
            end: Some("p2".into()),
            state: Vec::new(),
        };

        fill(txn.as_mut(), &live, "p1", &response).expect("fill");

        let live = fragments::require(txn.as_ref(), ROOM, 1).expect("live");
        assert_eq!(live.previous_token.as_deref(), Some("p2"));
        assert!(!live.start_reached);
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let storage = MemoryStorage::new();
        let (mut txn, live) = split_room(&storage).await;
        let response = MessagesResponse::default();

        let err = fill(txn.as_mut(), &live, "other", &response).expect_err("token changed");
        assert_eq!(err.code, "stale_gap_token");
    }

    #[tokio::test]
    async fn overlap_with_own_fragment_drops_token_without_reaching_start() {
        let storage = MemoryStorage::new();
        let (mut txn, live) = split_room(&storage).await;
        let response = MessagesResponse {
            chunk: vec![event("$5"), event("$6")],
            start: "p1".into(),
            end: Some("p2".into()),
            state: Vec::new(),
        };

        let result = fill(txn.as_mut(), &live, "p1", &response).expect("fill");

        let live = fragments::require(txn.as_ref(), ROOM, 1).expect("live");
        assert_eq!(live.previous_token, None);
        assert_eq!(live.previous_id, None);
        assert!(!live.start_reached);
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn linked_edge_skips_duplicates_other_than_the_neighbour_edge() {
        let storage = MemoryStorage::new();
        let (mut txn, mut live) = split_room(&storage).await;
        let mut old = fragments::require(txn.as_ref(), ROOM, 0).expect("old");
        old.next_id = Some(1);
        live.previous_id = Some(0);
        fragments::put(txn.as_mut(), &old).expect("put");
        fragments::put(txn.as_mut(), &live).expect("put");

        let response = MessagesResponse {
            chunk: vec![event("$2"), event("$5"), event("$3")],
            start: "p1".into(),
            end: Some("p2".into()),
            state: Vec::new(),
        };
        let result = fill(txn.as_mut(), &live, "p1", &response).expect("fill");

        let ids: Vec<_> = result
            .entries
            .iter()
            .filter_map(TimelineEntry::as_event)
            .map(EventEntry::event_id)
            .collect();
        assert_eq!(ids, ["$5"]);
        let live = fragments::require(txn.as_ref(), ROOM, 1).expect("live");
        assert_eq!(live.previous_token, None);
        assert_eq!(live.previous_id, Some(0));
    }

    #[test]
    fn refuses_conflicting_links() {
        let mut fragment = Fragment::new_live(ROOM, 2, Some("t".into()));
        fragment.previous_id = Some(7);
        let mut neighbour = Fragment::new_live(ROOM, 1, None);

        let err = link(&mut fragment, &mut neighbour, Direction::Backward).expect_err("conflict");
        assert_eq!(err.code, "conflicting_link");

        let mut same = fragment.clone();
        let err = link(&mut fragment, &mut same, Direction::Backward).expect_err("self");
        assert_eq!(err.code, "self_link");
    }
}
