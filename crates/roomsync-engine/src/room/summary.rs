use roomsync_core::{Membership, RawEvent, RoomSummary, UnreadNotifications, event_types};

/// Apply one state or timeline event to the summary.
pub(crate) fn apply_event(summary: &mut RoomSummary, event: &RawEvent, own_user_id: &str) {
    match event.event_type.as_str() {
        event_types::NAME if event.is_state() => {
            summary.name = event
                .content_str("name")
                .filter(|name| !name.is_empty())
                .map(str::to_owned);
        }
        event_types::ENCRYPTION if event.is_state() => summary.is_encrypted = true,
        event_types::MEMBER if event.state_key.as_deref() == Some(own_user_id) => {
            if let Some(membership) = Membership::from_content(&event.content) {
                summary.membership = membership;
            }
            if event
                .content
                .get("is_direct")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
            {
                summary.is_direct = true;
            }
        }
        _ => {}
    }

    if !event.is_state() && event.origin_server_ts > 0 {
        summary.last_message_ts = Some(
            summary
                .last_message_ts
                .map_or(event.origin_server_ts, |ts| ts.max(event.origin_server_ts)),
        );
    }
}

/// Apply a room's sync section; returns the updated summary.
pub(crate) fn apply_sync<'a>(
    current: &RoomSummary,
    membership: Membership,
    events: impl IntoIterator<Item = &'a RawEvent>,
    unread: Option<UnreadNotifications>,
    own_user_id: &str,
) -> RoomSummary {
    let mut summary = current.clone();
    summary.membership = membership;
    for event in events {
        apply_event(&mut summary, event, own_user_id);
    }
    if let Some(unread) = unread {
        summary.unread_notifications = unread.notification_count;
        summary.highlight_count = unread.highlight_count;
    }
    summary
}
