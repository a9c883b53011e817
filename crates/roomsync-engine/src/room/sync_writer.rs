use std::{collections::HashMap, sync::Mutex};

use roomsync_core::{
    EngineError, EventEntry, EventKey, FIRST_FRAGMENT_ID, Fragment, FragmentBoundaryEntry,
    PENDING_FRAGMENT_ID, RawEvent, TimelineEntry, TimelineSlice,
};
use roomsync_store::Transaction;
use tracing::{debug, info};

use super::members::{MemberCache, RoomMember};
use crate::{
    crypto::DecryptionResults,
    lock,
    storage::{events, fragments, members, room_state},
};

/// What a committed write changed, applied to memory after commit.
#[derive(Debug, Default)]
pub(crate) struct TimelineWriteResult {
    /// New or updated entries in timeline order.
    pub entries: Vec<TimelineEntry>,
    /// Boundaries to refresh only if an open timeline shows them.
    pub updated: Vec<TimelineEntry>,
    /// Fragments created or relinked by the write.
    pub fragments: Vec<Fragment>,
    /// Members learnt from the batch.
    pub members: Vec<RoomMember>,
    /// Live key after the write, for the sync writer.
    pub live_key: Option<EventKey>,
}

/// Appends live events to the room's live fragment.
#[derive(Debug)]
pub(crate) struct SyncWriter {
    room_id: String,
    last_live_key: Mutex<Option<EventKey>>,
}

impl SyncWriter {
    pub(crate) fn new(room_id: impl Into<String>, last_live_key: Option<EventKey>) -> Self {
        Self {
            room_id: room_id.into(),
            last_live_key: Mutex::new(last_live_key),
        }
    }

    /// Key of the newest live event, or of an empty live fragment's middle.
    pub(crate) fn load_live_key(
        txn: &dyn Transaction,
        room_id: &str,
    ) -> Result<Option<EventKey>, EngineError> {
        let Some(live) = fragments::live(txn, room_id)? else {
            return Ok(None);
        };
        let key = events::last_in_fragment(txn, room_id, live.id)?
            .map_or_else(|| EventKey::default_fragment_key(live.id), |entry| entry.key);
        Ok(Some(key))
    }

    pub(crate) fn live_key(&self) -> Option<EventKey> {
        *lock(&self.last_live_key)
    }

    /// Advance the in-memory live key once the write committed.
    pub(crate) fn after_commit(&self, live_key: Option<EventKey>) {
        if live_key.is_some() {
            *lock(&self.last_live_key) = live_key;
        }
    }

    /// Write one sync batch. `since` is the sync token the batch was
    /// requested from.
    pub(crate) fn write(
        &self,
        txn: &mut dyn Transaction,
        timeline: &TimelineSlice,
        state: &[RawEvent],
        since: Option<&str>,
        decryption: &DecryptionResults,
        cache: &Mutex<MemberCache>,
    ) -> Result<TimelineWriteResult, EngineError> {
        let room_id = self.room_id.as_str();
        let mut result = TimelineWriteResult::default();
        let mut batch_members: HashMap<String, RoomMember> = HashMap::new();

        for event in state {
            room_state::set(txn, room_id, event)?;
            if let Some(member) = RoomMember::from_member_event(room_id, event) {
                batch_members.insert(member.user_id.clone(), member);
            }
        }

        let live_key = match self.live_key() {
            Some(key) => Some(key),
            None => Self::load_live_key(txn, room_id)?,
        };
        let mut current = match live_key {
            None => self.create_live_fragment(txn, timeline, &mut result)?,
            Some(key) if timeline.limited => {
                self.replace_live_fragment(txn, key, timeline, since, &mut result)?
            }
            Some(key) => key,
        };

        for event in &timeline.events {
            validate_event(event)?;
            if events::key_for_event_id(txn, room_id, &event.event_id)?.is_some() {
                debug!(room_id, event_id = %event.event_id, "skipping duplicate live event");
                continue;
            }
            let key = current.next_key().ok_or_else(|| {
                EngineError::consistency(
                    "fragment_full",
                    format!("no key left after {current} in {room_id}"),
                )
            })?;

            if event.is_state() {
                room_state::set(txn, room_id, event)?;
            }
            if let Some(member) = RoomMember::from_member_event(room_id, event) {
                batch_members.insert(member.user_id.clone(), member);
            }

            let mut entry = EventEntry::new(room_id, key, event.clone());
            entry.decryption = decryption.get(&event.event_id).cloned();
            if let Some(sender) = resolve_sender(txn, room_id, &event.sender, &batch_members, cache)? {
                entry.display_name = sender.display_name;
                entry.avatar_url = sender.avatar_url;
            }
            events::insert(txn, &entry)?;
            result.entries.push(entry.into());
            current = key;
        }

        for member in batch_members.values() {
            members::set(txn, member)?;
        }
        result.members = batch_members.into_values().collect();
        result.live_key = Some(current);
        Ok(result)
    }

    fn create_live_fragment(
        &self,
        txn: &mut dyn Transaction,
        timeline: &TimelineSlice,
        result: &mut TimelineWriteResult,
    ) -> Result<EventKey, EngineError> {
        let id = next_fragment_id(txn, &self.room_id)?;
        let fragment = Fragment::new_live(&self.room_id, id, timeline.prev_batch.clone());
        fragments::put(txn, &fragment)?;
        info!(room_id = %self.room_id, fragment_id = id, "created live fragment");

        result
            .entries
            .push(FragmentBoundaryEntry::start(fragment.clone()).into());
        result.fragments.push(fragment);
        Ok(EventKey::default_fragment_key(id))
    }

    fn replace_live_fragment(
        &self,
        txn: &mut dyn Transaction,
        live_key: EventKey,
        timeline: &TimelineSlice,
        since: Option<&str>,
        result: &mut TimelineWriteResult,
    ) -> Result<EventKey, EngineError> {
        let mut old = fragments::require(txn, &self.room_id, live_key.fragment_id)?;
        let id = next_fragment_id(txn, &self.room_id)?;

        old.next_id = Some(id);
        old.next_token = since
            .map(str::to_owned)
            .or_else(|| timeline.prev_batch.clone());
        let mut new = Fragment::new_live(&self.room_id, id, timeline.prev_batch.clone());
        new.previous_id = Some(old.id);
        new.start_reached = false;

        fragments::put(txn, &old)?;
        fragments::put(txn, &new)?;
        info!(
            room_id = %self.room_id,
            old_fragment_id = old.id,
            fragment_id = id,
            "limited sync, started new live fragment"
        );

        result
            .entries
            .push(FragmentBoundaryEntry::end(old.clone()).into());
        result
            .entries
            .push(FragmentBoundaryEntry::start(new.clone()).into());
        result.fragments.push(old);
        result.fragments.push(new);
        Ok(EventKey::default_fragment_key(id))
    }
}

/// Next unused fragment id of the room.
pub(crate) fn next_fragment_id(txn: &dyn Transaction, room_id: &str) -> Result<u32, EngineError> {
    let id = match fragments::max_id(txn, room_id)? {
        None => FIRST_FRAGMENT_ID,
        Some(max) => max.checked_add(1).unwrap_or(PENDING_FRAGMENT_ID),
    };
    if id == PENDING_FRAGMENT_ID {
        return Err(EngineError::consistency(
            "fragment_id_exhausted",
            format!("no fragment id left in {room_id}"),
        ));
    }
    Ok(id)
}

pub(crate) fn validate_event(event: &RawEvent) -> Result<(), EngineError> {
    if event.event_id.is_empty() || event.sender.is_empty() {
        return Err(EngineError::consistency(
            "malformed_event",
            format!(
                "event of type '{}' lacks an event id or sender",
                event.event_type
            ),
        ));
    }
    Ok(())
}

/// Display fields for `sender`: the batch first, then the cache, then the store.
pub(crate) fn resolve_sender(
    txn: &dyn Transaction,
    room_id: &str,
    sender: &str,
    batch: &HashMap<String, RoomMember>,
    cache: &Mutex<MemberCache>,
) -> Result<Option<RoomMember>, EngineError> {
    if let Some(member) = batch.get(sender) {
        return Ok(Some(member.clone()));
    }
    if let Some(member) = lock(cache).get(sender) {
        return Ok(Some(member));
    }
    members::get(txn, room_id, sender)
}
