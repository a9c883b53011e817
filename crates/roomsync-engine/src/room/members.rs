use std::num::NonZeroUsize;

use lru::LruCache;
use roomsync_core::{Membership, RawEvent};
use serde::{Deserialize, Serialize};

/// Membership record of one user in one room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub room_id: String,
    pub user_id: String,
    pub membership: Membership,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl RoomMember {
    /// Build from an `m.room.member` state event; `None` for anything else.
    pub fn from_member_event(room_id: &str, event: &RawEvent) -> Option<Self> {
        if !event.is_member_event() {
            return None;
        }
        let user_id = event.state_key.clone()?;
        let membership = Membership::from_content(&event.content)?;
        Some(Self {
            room_id: room_id.to_owned(),
            user_id,
            membership,
            display_name: event.content_str("displayname").map(str::to_owned),
            avatar_url: event.content_str("avatar_url").map(str::to_owned),
        })
    }
}

/// Bounded cache of recently seen members, used to fill sender display fields.
#[derive(Debug)]
pub(crate) struct MemberCache {
    members: LruCache<String, RoomMember>,
}

impl MemberCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            members: LruCache::new(capacity),
        }
    }

    pub(crate) fn get(&mut self, user_id: &str) -> Option<RoomMember> {
        self.members.get(user_id).cloned()
    }

    pub(crate) fn set(&mut self, member: RoomMember) {
        self.members.put(member.user_id.clone(), member);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}
