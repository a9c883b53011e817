use std::fmt;

use serde::{Deserialize, Serialize};

/// Smallest storable index; reserved for fragment start boundaries.
pub const MIN_INDEX: u32 = 0;
/// Index new fragments start from so they can grow in both directions.
pub const MIDDLE_INDEX: u32 = 0x8000_0000;
/// Largest storable index; reserved for fragment end boundaries.
pub const MAX_INDEX: u32 = u32::MAX;
/// Fragment id reserved for pending (not yet persisted) local events.
pub const PENDING_FRAGMENT_ID: u32 = u32::MAX;
/// Fragment id given to the first fragment of a room.
pub const FIRST_FRAGMENT_ID: u32 = 0;

/// Pagination direction relative to the timeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Backward => Direction::Forward,
            Direction::Forward => Direction::Backward,
        }
    }

    /// `dir` query value used by the messages endpoint.
    pub fn as_api_str(self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }
}

/// Composite ordering key `(fragment_id, event_index)`.
///
/// Keys only order against each other inside one fragment; ordering across
/// fragments goes through a [`FragmentIdComparer`](crate::FragmentIdComparer).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub fragment_id: u32,
    pub event_index: u32,
}

impl EventKey {
    pub const fn new(fragment_id: u32, event_index: u32) -> Self {
        Self {
            fragment_id,
            event_index,
        }
    }

    /// Key preceding the first event of a brand new fragment.
    pub const fn default_fragment_key(fragment_id: u32) -> Self {
        Self::new(fragment_id, MIDDLE_INDEX)
    }

    /// Key of a fragment's start boundary.
    pub const fn fragment_start(fragment_id: u32) -> Self {
        Self::new(fragment_id, MIN_INDEX)
    }

    /// Key of a fragment's end boundary.
    pub const fn fragment_end(fragment_id: u32) -> Self {
        Self::new(fragment_id, MAX_INDEX)
    }

    /// Next key in the same fragment, `None` when it would hit the end sentinel.
    pub fn next_key(self) -> Option<Self> {
        self.event_index
            .checked_add(1)
            .filter(|idx| *idx < MAX_INDEX)
            .map(|idx| Self::new(self.fragment_id, idx))
    }

    /// Previous key in the same fragment, `None` when it would hit the start sentinel.
    pub fn previous_key(self) -> Option<Self> {
        self.event_index
            .checked_sub(1)
            .filter(|idx| *idx > MIN_INDEX)
            .map(|idx| Self::new(self.fragment_id, idx))
    }

    pub fn next_key_for_direction(self, direction: Direction) -> Option<Self> {
        match direction {
            Direction::Forward => self.next_key(),
            Direction::Backward => self.previous_key(),
        }
    }

    pub fn is_boundary(self) -> bool {
        self.event_index == MIN_INDEX || self.event_index == MAX_INDEX
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.fragment_id, self.event_index)
    }
}
