//! Keys are `|`-separated strings; numeric parts are fixed-width lowercase hex
//! so that lexicographic order equals numeric order.

const SEPARATOR: char = '|';

/// Prefix shared by every key of a room.
pub fn room_prefix(room_id: &str) -> String {
    format!("{room_id}{SEPARATOR}")
}

/// `room|fragment|index`.
pub fn event_key(room_id: &str, fragment_id: u32, event_index: u32) -> String {
    format!("{room_id}{SEPARATOR}{fragment_id:08x}{SEPARATOR}{event_index:08x}")
}

/// `room|fragment`.
pub fn fragment_key(room_id: &str, fragment_id: u32) -> String {
    format!("{room_id}{SEPARATOR}{fragment_id:08x}")
}

/// `room|queue_index`.
pub fn pending_key(room_id: &str, queue_index: u64) -> String {
    format!("{room_id}{SEPARATOR}{queue_index:016x}")
}

/// `room|a|b|...` for free-form parts such as event ids or state keys.
pub fn room_scoped(room_id: &str, parts: &[&str]) -> String {
    let mut key = room_id.to_owned();
    for part in parts {
        key.push(SEPARATOR);
        key.push_str(part);
    }
    key
}

/// `(fragment_id, event_index)` from an event key.
pub fn parse_event_key(key: &str) -> Option<(u32, u32)> {
    let mut parts = key.rsplitn(3, SEPARATOR);
    let index = u32::from_str_radix(parts.next()?, 16).ok()?;
    let fragment = u32::from_str_radix(parts.next()?, 16).ok()?;
    parts.next()?;
    Some((fragment, index))
}

/// Trailing fragment id of a fragment key.
pub fn parse_fragment_id(key: &str) -> Option<u32> {
    let (_, id) = key.rsplit_once(SEPARATOR)?;
    u32::from_str_radix(id, 16).ok()
}

/// Trailing queue index of a pending event key.
pub fn parse_queue_index(key: &str) -> Option<u64> {
    let (_, index) = key.rsplit_once(SEPARATOR)?;
    u64::from_str_radix(index, 16).ok()
}

/// Smallest string greater than every string starting with `prefix`.
///
/// `None` when no such string exists.
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(u32::from(last) + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
