//! Scripted collaborators shared by the engine tests.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use roomsync_core::{
    DecryptionOutcome, Direction, EngineChannels, EngineError, InvitedRoom, MessagesResponse,
    RawEvent, RoomSyncResponse, SyncResponse, TimelineSlice, Unsigned, event_types,
};
use roomsync_store::{MemoryStorage, Storage, Transaction};
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::{
    api::{ApiError, HomeServerApi, SyncRequest},
    config::EngineConfig,
    crypto::{
        CryptoError, DecryptionChanges, DecryptionPreparation, DecryptionResults,
        EncryptedAttachment, EncryptedPayload, RoomEncryption,
    },
    lock,
    session::{Session, SessionConfig, SessionContext},
};

pub(crate) const ME: &str = "@me:example.org";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentEvent {
    pub room_id: String,
    pub event_type: String,
    pub txn_id: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Upload {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessagesRequest {
    pub room_id: String,
    pub from: String,
    pub direction: Direction,
    pub limit: u16,
}

#[derive(Default)]
struct MockState {
    syncs: VecDeque<Result<SyncResponse, ApiError>>,
    sync_requests: Vec<SyncRequest>,
    pages: VecDeque<Result<MessagesResponse, ApiError>>,
    messages_requests: Vec<MessagesRequest>,
    send_failures: VecDeque<ApiError>,
    send_attempts: Vec<SentEvent>,
    accepted: HashMap<String, String>,
    uploads: Vec<Upload>,
    filters_created: usize,
}

/// Homeserver that replays scripted responses.
///
/// A sync with nothing scripted waits until a response is pushed, like a long
/// poll without news. Sends are idempotent per transaction id.
#[derive(Default)]
pub(crate) struct MockHomeServer {
    state: Mutex<MockState>,
    sync_pushed: Notify,
}

impl MockHomeServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_sync(&self, response: SyncResponse) {
        lock(&self.state).syncs.push_back(Ok(response));
        self.sync_pushed.notify_waiters();
    }

    pub(crate) fn push_sync_error(&self, err: ApiError) {
        lock(&self.state).syncs.push_back(Err(err));
        self.sync_pushed.notify_waiters();
    }

    pub(crate) fn push_messages(&self, response: MessagesResponse) {
        lock(&self.state).pages.push_back(Ok(response));
    }

    pub(crate) fn fail_next_send(&self, err: ApiError) {
        lock(&self.state).send_failures.push_back(err);
    }

    pub(crate) fn sync_requests(&self) -> Vec<SyncRequest> {
        lock(&self.state).sync_requests.clone()
    }

    pub(crate) fn messages_requests(&self) -> Vec<MessagesRequest> {
        lock(&self.state).messages_requests.clone()
    }

    pub(crate) fn send_attempts(&self) -> Vec<SentEvent> {
        lock(&self.state).send_attempts.clone()
    }

    /// Events the server actually stored.
    pub(crate) fn distinct_events_sent(&self) -> usize {
        lock(&self.state).accepted.len()
    }

    pub(crate) fn uploads(&self) -> Vec<Upload> {
        lock(&self.state).uploads.clone()
    }

    pub(crate) fn filters_created(&self) -> usize {
        lock(&self.state).filters_created
    }
}

#[async_trait]
impl HomeServerApi for MockHomeServer {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ApiError> {
        lock(&self.state).sync_requests.push(request);
        loop {
            let pushed = self.sync_pushed.notified();
            let next = lock(&self.state).syncs.pop_front();
            if let Some(response) = next {
                return response;
            }
            pushed.await;
        }
    }

    async fn messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: u16,
    ) -> Result<MessagesResponse, ApiError> {
        let mut state = lock(&self.state);
        state.messages_requests.push(MessagesRequest {
            room_id: room_id.to_owned(),
            from: from.to_owned(),
            direction,
            limit,
        });
        state
            .pages
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Malformed("no page scripted".into())))
    }

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<String, ApiError> {
        let mut state = lock(&self.state);
        state.send_attempts.push(SentEvent {
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            txn_id: txn_id.to_owned(),
            content: content.clone(),
        });
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        let next_id = format!("$sent{}", state.accepted.len() + 1);
        Ok(state
            .accepted
            .entry(txn_id.to_owned())
            .or_insert(next_id)
            .clone())
    }

    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, ApiError> {
        let mut state = lock(&self.state);
        state.uploads.push(Upload {
            filename: filename.to_owned(),
            content_type: content_type.to_owned(),
            data,
        });
        Ok(format!("mxc://mock/{}", state.uploads.len()))
    }

    async fn create_filter(&self, _user_id: &str, _filter: Value) -> Result<String, ApiError> {
        let mut state = lock(&self.state);
        state.filters_created += 1;
        Ok(format!("filter{}", state.filters_created))
    }
}

/// Reversible "encryption": ciphertext is the JSON of the plaintext.
#[derive(Default)]
pub(crate) struct MockEncryption {
    to_device_received: Mutex<usize>,
}

impl MockEncryption {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn to_device_received(&self) -> usize {
        *lock(&self.to_device_received)
    }
}

#[async_trait]
impl RoomEncryption for MockEncryption {
    async fn encrypt(
        &self,
        _room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedPayload, CryptoError> {
        Ok(EncryptedPayload {
            event_type: event_types::ENCRYPTED.to_owned(),
            content: json!({"ciphertext": content.to_string(), "event_type": event_type}),
        })
    }

    async fn encrypt_attachment(&self, data: Vec<u8>) -> Result<EncryptedAttachment, CryptoError> {
        Ok(EncryptedAttachment {
            data: data.into_iter().rev().collect(),
            file_info: json!({"key": "k"}),
        })
    }

    async fn prepare_decryption(
        &self,
        _room_id: &str,
        events: &[RawEvent],
    ) -> Result<Box<dyn DecryptionPreparation>, CryptoError> {
        Ok(Box::new(MockPreparation {
            events: events.to_vec(),
        }))
    }

    async fn receive_to_device(&self, events: &[Value]) -> Result<(), CryptoError> {
        *lock(&self.to_device_received) += events.len();
        Ok(())
    }
}

struct MockPreparation {
    events: Vec<RawEvent>,
}

#[async_trait]
impl DecryptionPreparation for MockPreparation {
    async fn decrypt(self: Box<Self>) -> Result<Box<dyn DecryptionChanges>, CryptoError> {
        let results = self
            .events
            .iter()
            .map(|event| {
                let plaintext = event
                    .content_str("ciphertext")
                    .and_then(|ciphertext| serde_json::from_str::<Value>(ciphertext).ok());
                let outcome = match (plaintext, event.content_str("event_type")) {
                    (Some(content), Some(event_type)) => DecryptionOutcome::Decrypted {
                        event_type: event_type.to_owned(),
                        content,
                    },
                    _ => DecryptionOutcome::Failed {
                        code: "unknown_session".into(),
                        message: "no session for this event".into(),
                    },
                };
                (event.event_id.clone(), outcome)
            })
            .collect();
        Ok(Box::new(MockChanges { results }))
    }
}

struct MockChanges {
    results: DecryptionResults,
}

impl DecryptionChanges for MockChanges {
    fn write(self: Box<Self>, _txn: &mut dyn Transaction) -> Result<DecryptionResults, CryptoError> {
        Ok(self.results)
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        rate_limit_max_attempts: 2,
        ..EngineConfig::default()
    }
}

/// Context over a fresh in-memory store.
pub(crate) fn test_context(
    api: Arc<MockHomeServer>,
    encryption: Option<Arc<MockEncryption>>,
) -> Arc<SessionContext> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    context_with_storage(storage, api, encryption)
}

pub(crate) fn context_with_storage(
    storage: Arc<dyn Storage>,
    api: Arc<MockHomeServer>,
    encryption: Option<Arc<MockEncryption>>,
) -> Arc<SessionContext> {
    let config = test_config();
    Arc::new(SessionContext {
        storage,
        api,
        encryption: encryption.map(|encryption| encryption as Arc<dyn RoomEncryption>),
        channels: EngineChannels::new(config.event_buffer),
        config,
        user_id: ME.to_owned(),
    })
}

/// Session over `storage`, loaded the way an application would.
pub(crate) async fn test_session(
    storage: Arc<dyn Storage>,
    api: Arc<MockHomeServer>,
    encryption: Option<Arc<MockEncryption>>,
) -> Arc<Session> {
    let mut config = SessionConfig::new(ME, storage, api, test_config());
    if let Some(encryption) = encryption {
        config = config.with_encryption(encryption);
    }
    Session::load(config).await.expect("load session")
}

/// Run one sync response through prepare, write and apply.
pub(crate) async fn apply_sync(
    session: &Session,
    response: SyncResponse,
) -> Result<(), EngineError> {
    let since = session.sync_token();
    let preparation = session.prepare_sync(response).await?;
    let changes = session.write_sync(preparation, since.as_deref()).await?;
    session.after_sync(changes).await;
    Ok(())
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

pub(crate) fn message(event_id: &str, sender: &str, body: &str) -> RawEvent {
    RawEvent {
        event_id: event_id.into(),
        event_type: event_types::MESSAGE.into(),
        sender: sender.into(),
        origin_server_ts: 1_000,
        content: json!({"msgtype": "m.text", "body": body}),
        state_key: None,
        unsigned: None,
    }
}

/// Remote echo of a locally sent event.
pub(crate) fn echo(event_id: &str, txn_id: &str) -> RawEvent {
    RawEvent {
        unsigned: Some(Unsigned {
            transaction_id: Some(txn_id.into()),
        }),
        ..message(event_id, ME, "echo")
    }
}

pub(crate) fn member(user_id: &str, display_name: &str) -> RawEvent {
    RawEvent {
        event_id: format!("$member-{user_id}"),
        event_type: event_types::MEMBER.into(),
        sender: user_id.into(),
        origin_server_ts: 500,
        content: json!({"membership": "join", "displayname": display_name}),
        state_key: Some(user_id.into()),
        unsigned: None,
    }
}

/// Sync response with one joined room.
pub(crate) fn joined(
    next_batch: &str,
    room_id: &str,
    events: Vec<RawEvent>,
    limited: bool,
    prev_batch: Option<&str>,
) -> SyncResponse {
    let mut response = SyncResponse {
        next_batch: next_batch.into(),
        ..SyncResponse::default()
    };
    response.rooms.join.insert(
        room_id.into(),
        RoomSyncResponse {
            timeline: TimelineSlice {
                events,
                limited,
                prev_batch: prev_batch.map(str::to_owned),
            },
            ..RoomSyncResponse::default()
        },
    );
    response
}

pub(crate) fn invited(next_batch: &str, room_id: &str, state: Vec<RawEvent>) -> SyncResponse {
    let mut response = SyncResponse {
        next_batch: next_batch.into(),
        ..SyncResponse::default()
    };
    let mut invite = InvitedRoom::default();
    invite.invite_state.events = state;
    response.rooms.invite.insert(room_id.into(), invite);
    response
}
