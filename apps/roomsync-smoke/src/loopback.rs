//! In-process homeserver holding a single room.
//!
//! Sync tokens are `s{n}` (the first `n` events were delivered) and
//! pagination tokens are `t{n}` (the position before event `n`).

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use roomsync_core::{
    Direction, MessagesResponse, RawEvent, RoomSyncResponse, SyncResponse, TimelineSlice,
    Unsigned, event_types,
};
use roomsync_engine::{ApiError, HomeServerApi, SyncRequest};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

/// Events handed out by a sync without a token.
const INITIAL_WINDOW: usize = 5;

struct RoomHistory {
    state: Vec<RawEvent>,
    events: Vec<RawEvent>,
    accepted: HashMap<String, String>,
    uploads: usize,
}

pub struct LoopbackServer {
    room_id: String,
    user_id: String,
    history: Mutex<RoomHistory>,
    changed: Notify,
}

impl LoopbackServer {
    /// A room named `name` with `seeded` messages from another user.
    pub fn new(room_id: &str, user_id: &str, name: &str, seeded: usize) -> Self {
        let name_event = RawEvent {
            event_id: "$name".to_owned(),
            event_type: event_types::NAME.to_owned(),
            sender: "@alice:loopback".to_owned(),
            origin_server_ts: 1,
            content: json!({"name": name}),
            state_key: Some(String::new()),
            unsigned: None,
        };
        let events = (0..seeded)
            .map(|n| RawEvent {
                event_id: format!("$seed{n}"),
                event_type: event_types::MESSAGE.to_owned(),
                sender: "@alice:loopback".to_owned(),
                origin_server_ts: 10 + n as u64,
                content: json!({"msgtype": "m.text", "body": format!("history {n}")}),
                state_key: None,
                unsigned: None,
            })
            .collect();
        Self {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
            history: Mutex::new(RoomHistory {
                state: vec![name_event],
                events,
                accepted: HashMap::new(),
                uploads: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn history(&self) -> MutexGuard<'_, RoomHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond(&self, since: Option<usize>) -> Option<SyncResponse> {
        let history = self.history();
        let total = history.events.len();
        let (start, state) = match since {
            None => (total.saturating_sub(INITIAL_WINDOW), history.state.clone()),
            Some(seen) if seen < total => (seen, Vec::new()),
            Some(_) => return None,
        };
        let limited = since.is_none() && start > 0;
        let mut response = SyncResponse {
            next_batch: format!("s{total}"),
            ..SyncResponse::default()
        };
        let mut room = RoomSyncResponse {
            timeline: TimelineSlice {
                events: history.events[start..].to_vec(),
                limited,
                prev_batch: (start > 0).then(|| format!("t{start}")),
            },
            ..RoomSyncResponse::default()
        };
        room.state.events = state;
        response.rooms.join.insert(self.room_id.clone(), room);
        Some(response)
    }
}

#[async_trait]
impl HomeServerApi for LoopbackServer {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ApiError> {
        let since = request
            .since
            .as_deref()
            .map(|token| parse_token(token, 's'))
            .transpose()?;
        // Registered before checking so a concurrent send cannot be missed.
        let changed = self.changed.notified();
        if let Some(response) = self.respond(since) {
            return Ok(response);
        }
        if request.timeout_ms > 0 {
            let _ = tokio::time::timeout(Duration::from_millis(request.timeout_ms), changed).await;
        }
        Ok(self.respond(since).unwrap_or_else(|| SyncResponse {
            next_batch: request.since.unwrap_or_default(),
            ..SyncResponse::default()
        }))
    }

    async fn messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: u16,
    ) -> Result<MessagesResponse, ApiError> {
        if room_id != self.room_id {
            return Err(not_found(room_id));
        }
        let position = parse_token(from, 't')?;
        let history = self.history();
        let position = position.min(history.events.len());
        let limit = usize::from(limit);
        let (chunk, end) = match direction {
            Direction::Backward => {
                let start = position.saturating_sub(limit);
                let chunk = history.events[start..position].iter().rev().cloned().collect();
                (chunk, (start > 0).then(|| format!("t{start}")))
            }
            Direction::Forward => {
                let stop = (position + limit).min(history.events.len());
                let chunk = history.events[position..stop].to_vec();
                (chunk, (stop < history.events.len()).then(|| format!("t{stop}")))
            }
        };
        debug!(from, ?direction, limit, "serving history page");
        Ok(MessagesResponse {
            chunk,
            start: from.to_owned(),
            end,
            state: history.state.clone(),
        })
    }

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<String, ApiError> {
        if room_id != self.room_id {
            return Err(not_found(room_id));
        }
        let event_id = {
            let mut history = self.history();
            if let Some(event_id) = history.accepted.get(txn_id) {
                return Ok(event_id.clone());
            }
            let event_id = format!("$local{}", history.events.len());
            let origin_server_ts = 10 + history.events.len() as u64;
            history.events.push(RawEvent {
                event_id: event_id.clone(),
                event_type: event_type.to_owned(),
                sender: self.user_id.clone(),
                origin_server_ts,
                content: content.clone(),
                state_key: None,
                unsigned: Some(Unsigned {
                    transaction_id: Some(txn_id.to_owned()),
                }),
            });
            history.accepted.insert(txn_id.to_owned(), event_id.clone());
            event_id
        };
        self.changed.notify_waiters();
        Ok(event_id)
    }

    async fn upload(
        &self,
        _filename: &str,
        _content_type: &str,
        _data: Vec<u8>,
    ) -> Result<String, ApiError> {
        let mut history = self.history();
        history.uploads += 1;
        Ok(format!("mxc://loopback/{}", history.uploads))
    }

    async fn create_filter(&self, _user_id: &str, _filter: Value) -> Result<String, ApiError> {
        Ok("loopback".to_owned())
    }
}

fn parse_token(token: &str, prefix: char) -> Result<usize, ApiError> {
    token
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ApiError::Rejected {
            status: 400,
            errcode: "M_INVALID_PARAM".to_owned(),
            message: format!("unknown token {token}"),
        })
}

fn not_found(room_id: &str) -> ApiError {
    ApiError::Rejected {
        status: 404,
        errcode: "M_NOT_FOUND".to_owned(),
        message: format!("unknown room {room_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!smoke:loopback";

    fn server() -> LoopbackServer {
        LoopbackServer::new(ROOM, "@me:loopback", "Smoke", 12)
    }

    fn request(since: Option<&str>, timeout_ms: u64) -> SyncRequest {
        SyncRequest {
            since: since.map(str::to_owned),
            filter_id: None,
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn initial_sync_is_a_limited_window() {
        let response = server().sync(request(None, 0)).await.expect("sync");
        assert_eq!(response.next_batch, "s12");
        let room = &response.rooms.join[ROOM];
        assert!(room.timeline.limited);
        assert_eq!(room.timeline.events.len(), INITIAL_WINDOW);
        assert_eq!(room.timeline.prev_batch.as_deref(), Some("t7"));
        assert_eq!(room.state.events.len(), 1);
    }

    #[tokio::test]
    async fn backward_pages_are_newest_first_and_end_at_the_start() {
        let server = server();
        let page = server
            .messages(ROOM, "t7", Direction::Backward, 5)
            .await
            .expect("page");
        assert_eq!(page.chunk[0].event_id, "$seed6");
        assert_eq!(page.end.as_deref(), Some("t2"));

        let last = server
            .messages(ROOM, "t2", Direction::Backward, 5)
            .await
            .expect("page");
        assert_eq!(last.chunk.len(), 2);
        assert_eq!(last.end, None);
    }

    #[tokio::test]
    async fn sends_are_idempotent_and_wake_long_polls() {
        let server = std::sync::Arc::new(server());
        let poll = {
            let server = server.clone();
            tokio::spawn(async move { server.sync(request(Some("s12"), 5_000)).await })
        };
        tokio::task::yield_now().await;

        let body = json!({"body": "hi"});
        let first = server
            .send(ROOM, event_types::MESSAGE, "txn1", &body)
            .await
            .expect("send");
        let again = server
            .send(ROOM, event_types::MESSAGE, "txn1", &body)
            .await
            .expect("send");
        assert_eq!(first, again);

        let response = poll.await.expect("join").expect("sync");
        assert_eq!(response.next_batch, "s13");
        let events = &response.rooms.join[ROOM].timeline.events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction_id(), Some("txn1"));
    }
}
