use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_key::Direction;

/// One contiguous, independently paginated run of a room's events.
///
/// A link (`previous_id`/`next_id`) means the relative order of two fragments
/// is known. A token means the edge has not been proven to touch either the
/// room's start/end or its neighbor, so a gap remains there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fragment {
    pub room_id: String,
    pub id: u32,
    pub previous_id: Option<u32>,
    pub next_id: Option<u32>,
    pub previous_token: Option<String>,
    pub next_token: Option<String>,
    #[serde(default)]
    pub start_reached: bool,
    #[serde(default)]
    pub end_reached: bool,
}

impl Fragment {
    /// Create a fresh live fragment.
    ///
    /// Without a backward token the server has told us there is no older
    /// history, so the start is marked reached.
    pub fn new_live(room_id: impl Into<String>, id: u32, previous_token: Option<String>) -> Self {
        let start_reached = previous_token.is_none();
        Self {
            room_id: room_id.into(),
            id,
            previous_id: None,
            next_id: None,
            previous_token,
            next_token: None,
            start_reached,
            end_reached: false,
        }
    }

    /// The live fragment is the one receiving pushed events.
    pub fn is_live(&self) -> bool {
        self.next_id.is_none() && self.next_token.is_none()
    }

    pub fn token(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Backward => self.previous_token.as_deref(),
            Direction::Forward => self.next_token.as_deref(),
        }
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<String>) {
        match direction {
            Direction::Backward => self.previous_token = token,
            Direction::Forward => self.next_token = token,
        }
    }

    pub fn linked_id(&self, direction: Direction) -> Option<u32> {
        match direction {
            Direction::Backward => self.previous_id,
            Direction::Forward => self.next_id,
        }
    }

    pub fn set_linked_id(&mut self, direction: Direction, id: Option<u32>) {
        match direction {
            Direction::Backward => self.previous_id = id,
            Direction::Forward => self.next_id = id,
        }
    }

    pub fn edge_reached(&self, direction: Direction) -> bool {
        match direction {
            Direction::Backward => self.start_reached,
            Direction::Forward => self.end_reached,
        }
    }

    pub fn set_edge_reached(&mut self, direction: Direction, reached: bool) {
        match direction {
            Direction::Backward => self.start_reached = reached,
            Direction::Forward => self.end_reached = reached,
        }
    }

    /// Whether the edge can still be backfilled.
    pub fn has_gap(&self, direction: Direction) -> bool {
        self.token(direction).is_some()
    }
}

/// Errors raised when fragment order cannot be proven.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComparerError {
    #[error("fragment {0} is not known to the comparer")]
    UnknownFragment(u32),
    #[error("fragments {a} and {b} are in different islands, their order is unknown")]
    DifferentIslands { a: u32, b: u32 },
    #[error("fragment links form a cycle through fragment {0}")]
    Cycle(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentLink {
    previous_id: Option<u32>,
    next_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IslandPosition {
    island: usize,
    index: usize,
}

/// Orders fragment ids by walking their links into islands.
///
/// Only fragments that were added are known; a link to an unknown fragment
/// ends the island there.
#[derive(Debug, Clone, Default)]
pub struct FragmentIdComparer {
    links: BTreeMap<u32, FragmentLink>,
    positions: HashMap<u32, IslandPosition>,
    island_count: usize,
}

impl FragmentIdComparer {
    pub fn new<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Result<Self, ComparerError> {
        let mut comparer = Self::default();
        comparer.add_all(fragments)?;
        Ok(comparer)
    }

    /// Add or refresh one fragment and rebuild the islands.
    pub fn add(&mut self, fragment: &Fragment) -> Result<(), ComparerError> {
        self.add_all(std::iter::once(fragment))
    }

    /// Add or refresh several fragments with a single rebuild.
    pub fn add_all<'a>(
        &mut self,
        fragments: impl IntoIterator<Item = &'a Fragment>,
    ) -> Result<(), ComparerError> {
        for fragment in fragments {
            self.links.insert(
                fragment.id,
                FragmentLink {
                    previous_id: fragment.previous_id,
                    next_id: fragment.next_id,
                },
            );
        }
        self.rebuild()
    }

    pub fn contains(&self, fragment_id: u32) -> bool {
        self.links.contains_key(&fragment_id)
    }

    pub fn island_count(&self) -> usize {
        self.island_count
    }

    pub fn same_island(&self, a: u32, b: u32) -> bool {
        match (self.positions.get(&a), self.positions.get(&b)) {
            (Some(pa), Some(pb)) => pa.island == pb.island,
            _ => false,
        }
    }

    pub fn compare(&self, a: u32, b: u32) -> Result<Ordering, ComparerError> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let pa = self
            .positions
            .get(&a)
            .ok_or(ComparerError::UnknownFragment(a))?;
        let pb = self
            .positions
            .get(&b)
            .ok_or(ComparerError::UnknownFragment(b))?;
        if pa.island != pb.island {
            return Err(ComparerError::DifferentIslands { a, b });
        }
        Ok(pa.index.cmp(&pb.index))
    }

    fn rebuild(&mut self) -> Result<(), ComparerError> {
        let mut remaining: HashSet<u32> = self.links.keys().copied().collect();
        let mut positions = HashMap::with_capacity(remaining.len());
        let mut island = 0;

        for &seed in self.links.keys() {
            if !remaining.contains(&seed) {
                continue;
            }

            let mut first = seed;
            let mut seen = HashSet::from([seed]);
            while let Some(previous) = self.links[&first]
                .previous_id
                .filter(|id| remaining.contains(id))
            {
                if !seen.insert(previous) {
                    return Err(ComparerError::Cycle(previous));
                }
                first = previous;
            }

            let mut current = Some(first);
            let mut index = 0;
            while let Some(id) = current {
                remaining.remove(&id);
                positions.insert(id, IslandPosition { island, index });
                index += 1;
                current = self.links[&id].next_id.filter(|next| remaining.contains(next));
            }
            island += 1;
        }

        self.positions = positions;
        self.island_count = island;
        Ok(())
    }
}
