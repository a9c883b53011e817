use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use roomsync_core::{
    EngineChannels, EngineError, EngineEvent, EventStream, RoomSummary, SyncResponse, SyncSnapshot,
};
use roomsync_store::{Storage, StoreName};
use serde_json::json;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::{
    api::{HomeServerApi, retry_rate_limited},
    config::EngineConfig,
    crypto::{RoomEncryption, map_crypto_error},
    lock,
    room::{Room, RoomSection, RoomSyncChanges, RoomSyncPreparation},
    storage::{read_txn, session as session_store, summary as summary_store, write_txn},
    sync::{SyncError, SyncLoop},
};

/// Everything a session hands to its rooms.
pub(crate) struct SessionContext {
    pub storage: Arc<dyn Storage>,
    pub api: Arc<dyn HomeServerApi>,
    pub encryption: Option<Arc<dyn RoomEncryption>>,
    pub config: EngineConfig,
    pub channels: EngineChannels,
    pub user_id: String,
}

/// Inputs of [`Session::load`].
pub struct SessionConfig {
    pub user_id: String,
    pub storage: Arc<dyn Storage>,
    pub api: Arc<dyn HomeServerApi>,
    pub encryption: Option<Arc<dyn RoomEncryption>>,
    pub engine: EngineConfig,
}

impl SessionConfig {
    pub fn new(
        user_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        api: Arc<dyn HomeServerApi>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
            api,
            encryption: None,
            engine,
        }
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn RoomEncryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }
}

#[derive(Debug, Default)]
struct TokenState {
    sync_token: Option<String>,
    filter_id: Option<String>,
}

/// Rooms touched by one sync response, ready to be written.
pub(crate) struct SyncPreparation {
    next_batch: String,
    rooms: Vec<PreparedRoom>,
}

struct PreparedRoom {
    room: Arc<Room>,
    is_new: bool,
    preparation: RoomSyncPreparation,
}

/// Committed result of one sync write.
pub(crate) struct SyncChanges {
    next_batch: String,
    rooms: Vec<(Arc<Room>, bool, RoomSyncChanges)>,
}

/// A logged-in user's replicated state.
pub struct Session {
    context: Arc<SessionContext>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    tokens: Mutex<TokenState>,
    sync: SyncLoop,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.context.user_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Restore the session and its rooms from storage.
    pub async fn load(config: SessionConfig) -> Result<Arc<Self>, EngineError> {
        let SessionConfig {
            user_id,
            storage,
            api,
            encryption,
            engine,
        } = config;
        let context = Arc::new(SessionContext {
            channels: EngineChannels::new(engine.event_buffer),
            storage,
            api,
            encryption,
            config: engine,
            user_id,
        });

        let (stored, summaries) = read_txn(
            context.storage.as_ref(),
            &[StoreName::Session, StoreName::RoomSummary],
            "load_session",
            |txn| Ok((session_store::load(txn)?, summary_store::all(txn)?)),
        )
        .await?;

        let mut rooms = HashMap::with_capacity(summaries.len());
        for summary in summaries {
            let room = Room::load(Arc::clone(&context), summary).await?;
            rooms.insert(room.room_id().to_owned(), room);
        }
        info!(
            user_id = %context.user_id,
            rooms = rooms.len(),
            has_sync_token = stored.sync_token.is_some(),
            "session loaded"
        );

        Ok(Arc::new(Self {
            context,
            rooms: RwLock::new(rooms),
            tokens: Mutex::new(TokenState {
                sync_token: stored.sync_token,
                filter_id: stored.filter_id,
            }),
            sync: SyncLoop::new(),
        }))
    }

    pub fn user_id(&self) -> &str {
        &self.context.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> EventStream {
        self.context.channels.subscribe()
    }

    pub fn sync_token(&self) -> Option<String> {
        lock(&self.tokens).sync_token.clone()
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// All known rooms, ordered by room id.
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| a.room_id().cmp(b.room_id()));
        rooms
    }

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        self.rooms().await.iter().map(|room| room.summary()).collect()
    }

    /// Start the sync loop; fails if it is already running.
    pub async fn start_sync(self: &Arc<Self>) -> Result<(), EngineError> {
        self.sync.start(Arc::clone(self)).await
    }

    /// Stop the sync loop, cancelling the in-flight request.
    pub async fn stop_sync(&self) -> Result<(), EngineError> {
        self.sync.stop().await
    }

    pub fn sync_status(&self) -> SyncSnapshot {
        self.sync.snapshot()
    }

    pub fn watch_sync_status(&self) -> watch::Receiver<SyncSnapshot> {
        self.sync.watch()
    }

    pub(crate) fn api(&self) -> &dyn HomeServerApi {
        self.context.api.as_ref()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.context.channels.emit(event);
    }

    /// Id of the server-side sync filter, created and stored on first use.
    pub(crate) async fn ensure_filter(&self) -> Result<String, SyncError> {
        let stored = lock(&self.tokens).filter_id.clone();
        if let Some(filter_id) = stored {
            return Ok(filter_id);
        }

        let config = &self.context.config;
        let filter = json!({
            "room": {
                "state": {"lazy_load_members": true},
                "timeline": {"limit": config.filter_timeline_limit},
            }
        });
        let user_id = self.context.user_id.as_str();
        let api = &self.context.api;
        let filter_id = retry_rate_limited(&config.retry_policy(), "create_filter", || {
            api.create_filter(user_id, filter.clone())
        })
        .await?;
        write_txn(
            self.context.storage.as_ref(),
            &[StoreName::Session],
            "store_filter_id",
            |txn| session_store::set_filter_id(txn, &filter_id),
        )
        .await?;
        info!(filter_id = %filter_id, "created sync filter");
        lock(&self.tokens).filter_id = Some(filter_id.clone());
        Ok(filter_id)
    }

    /// Hand to-device events to encryption and decrypt each room's events,
    /// all before the write transaction opens.
    pub(crate) async fn prepare_sync(
        &self,
        response: SyncResponse,
    ) -> Result<SyncPreparation, EngineError> {
        let SyncResponse {
            next_batch,
            rooms,
            to_device,
        } = response;
        if let Some(encryption) = &self.context.encryption {
            if !to_device.events.is_empty() {
                encryption
                    .receive_to_device(&to_device.events)
                    .await
                    .map_err(|err| map_crypto_error("receive_to_device", err))?;
            }
        }

        let sections = rooms
            .join
            .into_iter()
            .map(|(id, room)| (id, RoomSection::Joined(room)))
            .chain(
                rooms
                    .leave
                    .into_iter()
                    .map(|(id, room)| (id, RoomSection::Left(room))),
            )
            .chain(
                rooms
                    .invite
                    .into_iter()
                    .map(|(id, room)| (id, RoomSection::Invited(room))),
            );

        let mut prepared = Vec::new();
        for (room_id, section) in sections {
            let (room, is_new) = match self.room(&room_id).await {
                Some(room) => (room, false),
                None => {
                    let summary = RoomSummary {
                        room_id: room_id.clone(),
                        membership: section.membership(),
                        ..RoomSummary::default()
                    };
                    (
                        Room::new(Arc::clone(&self.context), summary, None, Vec::new()),
                        true,
                    )
                }
            };
            let preparation = room.prepare_sync(section).await?;
            prepared.push(PreparedRoom {
                room,
                is_new,
                preparation,
            });
        }
        Ok(SyncPreparation {
            next_batch,
            rooms: prepared,
        })
    }

    /// Write every room and the new sync token in one transaction.
    pub(crate) async fn write_sync(
        &self,
        preparation: SyncPreparation,
        since: Option<&str>,
    ) -> Result<SyncChanges, EngineError> {
        let SyncPreparation { next_batch, rooms } = preparation;
        let written = write_txn(
            self.context.storage.as_ref(),
            &StoreName::ALL,
            "write_sync",
            |txn| {
                let mut written = Vec::with_capacity(rooms.len());
                for prepared in rooms {
                    let changes = prepared.room.write_sync(txn, prepared.preparation, since)?;
                    written.push((prepared.room, prepared.is_new, changes));
                }
                session_store::set_sync_token(txn, &next_batch)?;
                Ok(written)
            },
        )
        .await?;
        Ok(SyncChanges {
            next_batch,
            rooms: written,
        })
    }

    /// Apply a committed sync to memory and notify observers.
    pub(crate) async fn after_sync(&self, changes: SyncChanges) {
        lock(&self.tokens).sync_token = Some(changes.next_batch);
        for (room, is_new, room_changes) in changes.rooms {
            if is_new {
                self.rooms
                    .write()
                    .await
                    .insert(room.room_id().to_owned(), Arc::clone(&room));
                debug!(room_id = room.room_id(), "new room");
                self.emit(EngineEvent::RoomAdded {
                    room_id: room.room_id().to_owned(),
                });
            }
            if let Some(summary) = room.after_sync(room_changes).await {
                self.emit(EngineEvent::RoomUpdated(summary));
            }
        }
    }

    /// Let every room's send queue continue; a no-op for queues already online.
    pub(crate) async fn resume_send_queues(&self) {
        for room in self.rooms().await {
            room.resume_sending();
        }
    }
}
