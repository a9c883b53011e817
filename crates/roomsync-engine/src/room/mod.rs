//! Per-room replication state: live writes, gap fills, the send queue and
//! the open timeline.

mod gap_writer;
pub(crate) mod members;
mod pending_event;
mod send_queue;
mod summary;
mod sync_writer;
mod timeline;
mod timeline_reader;

use std::sync::{Arc, Mutex, Weak};

use roomsync_core::{
    Direction, EngineError, ErrorCategory, EventKey, FragmentBoundaryEntry, FragmentIdComparer,
    InvitedRoom, Membership, PendingEventData, PendingEventEntry, RawEvent, RoomSummary,
    RoomSyncResponse, TimelineBuffer,
};
use roomsync_store::{Storage, StoreName, Transaction};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use self::{members::RoomMember, pending_event::Attachment, timeline::Timeline};
use self::{
    gap_writer::{GapFill, GapWriter},
    members::MemberCache,
    send_queue::{PendingObserver, SendQueue},
    sync_writer::{SyncWriter, TimelineWriteResult},
    timeline::timeline_closed,
    timeline_reader::READ_STORES,
};
use crate::{
    api::{map_api_error, retry_rate_limited},
    crypto::{DecryptionChanges, prepare_room_decryption, write_decryption},
    lock,
    session::SessionContext,
    storage::{fragments, members as member_store, pending, read_txn, summary as summary_store, write_txn},
};

/// Stores a gap fill writes to.
const GAP_FILL_STORES: [StoreName; 4] = [
    StoreName::TimelineEvents,
    StoreName::TimelineEventIds,
    StoreName::TimelineFragments,
    StoreName::RoomMembers,
];

/// A room's section of one sync response.
#[derive(Debug)]
pub(crate) enum RoomSection {
    Joined(RoomSyncResponse),
    Left(RoomSyncResponse),
    Invited(InvitedRoom),
}

impl RoomSection {
    pub(crate) fn membership(&self) -> Membership {
        match self {
            RoomSection::Joined(_) => Membership::Join,
            RoomSection::Left(_) => Membership::Leave,
            RoomSection::Invited(_) => Membership::Invite,
        }
    }

    fn timeline_events(&self) -> &[RawEvent] {
        match self {
            RoomSection::Joined(room) | RoomSection::Left(room) => &room.timeline.events,
            RoomSection::Invited(_) => &[],
        }
    }
}

/// Work done before the sync transaction opens.
pub(crate) struct RoomSyncPreparation {
    section: RoomSection,
    decryption: Option<Box<dyn DecryptionChanges>>,
}

/// What a committed sync changed for one room.
#[derive(Debug)]
pub(crate) struct RoomSyncChanges {
    write: Option<TimelineWriteResult>,
    summary: RoomSummary,
    echoes: Vec<u64>,
}

/// One replicated room.
pub struct Room {
    room_id: String,
    context: Arc<SessionContext>,
    summary: Mutex<RoomSummary>,
    writer: SyncWriter,
    members: Mutex<MemberCache>,
    send_queue: Arc<SendQueue>,
    timeline: tokio::sync::Mutex<Weak<Timeline>>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub(crate) fn new(
        context: Arc<SessionContext>,
        summary: RoomSummary,
        live_key: Option<EventKey>,
        pending: Vec<PendingEventData>,
    ) -> Arc<Self> {
        let room_id = summary.room_id.clone();
        Arc::new(Self {
            writer: SyncWriter::new(room_id.as_str(), live_key),
            members: Mutex::new(MemberCache::new(context.config.member_cache_capacity)),
            send_queue: SendQueue::new(room_id.as_str(), Arc::clone(&context), pending),
            timeline: tokio::sync::Mutex::new(Weak::new()),
            summary: Mutex::new(summary),
            room_id,
            context,
        })
    }

    /// Restore a room from its stored summary.
    pub(crate) async fn load(
        context: Arc<SessionContext>,
        summary: RoomSummary,
    ) -> Result<Arc<Self>, EngineError> {
        let room_id = summary.room_id.as_str();
        let (live_key, pending) = read_txn(
            context.storage.as_ref(),
            &[
                StoreName::TimelineEvents,
                StoreName::TimelineFragments,
                StoreName::PendingEvents,
            ],
            "load_room",
            |txn| {
                Ok((
                    SyncWriter::load_live_key(txn, room_id)?,
                    pending::all(txn, room_id)?,
                ))
            },
        )
        .await?;
        debug!(room_id, pending = pending.len(), "loaded room");
        Ok(Self::new(context, summary, live_key, pending))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn summary(&self) -> RoomSummary {
        lock(&self.summary).clone()
    }

    /// Open the room's timeline. Only one can be open at a time.
    pub async fn open_timeline(self: &Arc<Self>) -> Result<Arc<Timeline>, EngineError> {
        let mut slot = self.timeline.lock().await;
        if slot.upgrade().is_some() {
            return Err(EngineError::new(
                ErrorCategory::Config,
                "timeline_already_open",
                format!("a timeline of {} is already open", self.room_id),
            ));
        }

        let room_id = self.room_id.as_str();
        let amount = self.context.config.open_timeline_amount;
        let (entries, all_fragments) =
            read_txn(self.storage(), &READ_STORES, "open_timeline", |txn| {
                let all = fragments::all(txn, room_id)?;
                let live_id = all.iter().filter(|f| f.is_live()).map(|f| f.id).max();
                let entries = match live_id {
                    Some(live_id) => timeline_reader::read_from(
                        txn,
                        room_id,
                        EventKey::fragment_end(live_id),
                        Direction::Backward,
                        amount,
                    )?,
                    None => Vec::new(),
                };
                Ok((entries, all))
            })
            .await?;
        let comparer = FragmentIdComparer::new(&all_fragments)
            .map_err(|err| EngineError::consistency("fragment_graph", err.to_string()))?;

        let timeline = Arc::new(Timeline::new(Arc::clone(self), entries, comparer)?);
        let observer: Arc<dyn PendingObserver> = timeline.clone();
        self.send_queue.attach(Arc::downgrade(&observer));
        *slot = Arc::downgrade(&timeline);
        info!(room_id, entries = timeline.entries().len(), "opened timeline");
        Ok(timeline)
    }

    /// Queue an event for sending; encrypted rooms encrypt it first.
    pub async fn send_event(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<PendingEventEntry, EngineError> {
        let encrypted = self.summary().is_encrypted;
        self.send_queue
            .enqueue(event_type, content, None, encrypted)
            .await
    }

    /// Queue an event whose attachment is uploaded before it is sent. The
    /// content URI is put into `content` as `url`, or `file.url` when
    /// encrypted.
    pub async fn send_attachment(
        &self,
        event_type: &str,
        content: Value,
        attachment: Attachment,
    ) -> Result<PendingEventEntry, EngineError> {
        let encrypted = self.summary().is_encrypted;
        self.send_queue
            .enqueue(event_type, content, Some(attachment), encrypted)
            .await
    }

    pub async fn abort_pending(&self, queue_index: u64) -> Result<bool, EngineError> {
        self.send_queue.abort(queue_index).await
    }

    pub fn retry_pending(&self, queue_index: u64) -> Result<(), EngineError> {
        self.send_queue.retry(queue_index)
    }

    pub fn pending_entries(&self) -> Vec<PendingEventEntry> {
        self.send_queue.entries()
    }

    /// Member record of `user_id`, from the cache or the store.
    pub async fn member(&self, user_id: &str) -> Result<Option<RoomMember>, EngineError> {
        let cached = lock(&self.members).get(user_id);
        if cached.is_some() {
            return Ok(cached);
        }
        let room_id = self.room_id.as_str();
        let member = read_txn(
            self.storage(),
            &[StoreName::RoomMembers],
            "load_member",
            |txn| member_store::get(txn, room_id, user_id),
        )
        .await?;
        if let Some(member) = &member {
            lock(&self.members).set(member.clone());
        }
        Ok(member)
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.context.storage.as_ref()
    }

    pub(crate) fn resume_sending(&self) {
        self.send_queue.resume();
    }

    /// Resolves once the send queue has nothing left it can send.
    pub async fn wait_send_idle(&self) {
        self.send_queue.wait_idle().await;
    }

    pub(crate) async fn detach_timeline(&self, timeline: &Timeline) {
        let mut slot = self.timeline.lock().await;
        let is_current = slot
            .upgrade()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), timeline));
        if is_current {
            *slot = Weak::new();
            self.send_queue.detach();
        }
    }

    /// Decrypt the section's events ahead of the sync transaction.
    pub(crate) async fn prepare_sync(
        &self,
        section: RoomSection,
    ) -> Result<RoomSyncPreparation, EngineError> {
        let decryption = prepare_room_decryption(
            self.context.encryption.as_ref(),
            &self.room_id,
            section.timeline_events(),
        )
        .await?;
        Ok(RoomSyncPreparation {
            section,
            decryption,
        })
    }

    /// Write the room's part of a sync inside the session-wide transaction.
    pub(crate) fn write_sync(
        &self,
        txn: &mut dyn Transaction,
        preparation: RoomSyncPreparation,
        since: Option<&str>,
    ) -> Result<RoomSyncChanges, EngineError> {
        let RoomSyncPreparation {
            section,
            decryption,
        } = preparation;
        let decrypted = write_decryption(decryption, txn)?;
        let own_user_id = self.context.user_id.as_str();
        let current = self.summary();

        let changes = match &section {
            RoomSection::Invited(invite) => RoomSyncChanges {
                write: None,
                summary: summary::apply_sync(
                    &current,
                    Membership::Invite,
                    &invite.invite_state.events,
                    None,
                    own_user_id,
                ),
                echoes: Vec::new(),
            },
            RoomSection::Joined(room) | RoomSection::Left(room) => {
                let write = self.writer.write(
                    txn,
                    &room.timeline,
                    &room.state.events,
                    since,
                    &decrypted,
                    &self.members,
                )?;
                let echoes = self.send_queue.find_echoes(&room.timeline.events);
                for &queue_index in &echoes {
                    pending::remove(txn, &self.room_id, queue_index)?;
                }
                RoomSyncChanges {
                    write: Some(write),
                    summary: summary::apply_sync(
                        &current,
                        section.membership(),
                        room.state.events.iter().chain(&room.timeline.events),
                        room.unread_notifications,
                        own_user_id,
                    ),
                    echoes,
                }
            }
        };
        summary_store::set(txn, &changes.summary)?;
        Ok(changes)
    }

    /// Apply a committed sync to memory. Returns the summary if it changed.
    pub(crate) async fn after_sync(&self, changes: RoomSyncChanges) -> Option<RoomSummary> {
        let RoomSyncChanges {
            write,
            summary,
            echoes,
        } = changes;
        if !echoes.is_empty() {
            self.send_queue.remove_echoed(&echoes);
        }
        if let Some(write) = &write {
            self.writer.after_commit(write.live_key);
            self.remember_members(write);
            let timeline = self.timeline.lock().await.upgrade();
            if let Some(timeline) = timeline {
                timeline.apply_write(write);
            }
        }

        let mut current = lock(&self.summary);
        if *current == summary {
            return None;
        }
        *current = summary.clone();
        Some(summary)
    }

    /// Fetch a page of history at `boundary` and write it into its fragment.
    pub(crate) async fn fill_gap(
        &self,
        boundary: &FragmentBoundaryEntry,
        amount: u16,
        cancel: &CancellationToken,
    ) -> Result<TimelineWriteResult, EngineError> {
        let room_id = self.room_id.as_str();
        let token = boundary.token().ok_or_else(|| {
            EngineError::new(
                ErrorCategory::Config,
                "no_gap",
                format!("fragment {} of {room_id} has no gap there", boundary.fragment_id()),
            )
        })?;
        let direction = boundary.direction();
        let limit =
            TimelineBuffer::bounded_paginate_limit(amount, self.context.config.pagination_limit_cap);
        let policy = self.context.config.retry_policy();
        let api = &self.context.api;
        debug!(room_id, fragment_id = boundary.fragment_id(), limit, "filling gap");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(timeline_closed(room_id)),
            response = retry_rate_limited(&policy, "messages", || {
                api.messages(room_id, token, direction, limit)
            }) => response.map_err(|err| map_api_error("messages", err))?,
        };
        let decryption = tokio::select! {
            _ = cancel.cancelled() => return Err(timeline_closed(room_id)),
            changes = prepare_room_decryption(
                self.context.encryption.as_ref(),
                room_id,
                &response.chunk,
            ) => changes?,
        };

        let result = write_txn(self.storage(), &GAP_FILL_STORES, "fill_gap", |txn| {
            let decrypted = write_decryption(decryption, txn)?;
            GapWriter::new(room_id).write_fragment_fill(
                txn,
                GapFill {
                    boundary,
                    token,
                    response: &response,
                },
                &decrypted,
                &self.members,
            )
        })
        .await?;
        self.remember_members(&result);
        info!(
            room_id,
            fragment_id = boundary.fragment_id(),
            fetched = response.chunk.len(),
            "gap fill written"
        );
        Ok(result)
    }

    fn remember_members(&self, write: &TimelineWriteResult) {
        let mut cache = lock(&self.members);
        for member in &write.members {
            cache.set(member.clone());
        }
    }
}
