//! Durable per-room outbox.
//!
//! Events are sent one at a time in queue order. A transport failure puts the
//! queue offline until [`SendQueue::resume`]; other failures park the event in
//! `Error` and the queue moves on.

use std::{
    future::Future,
    sync::{Arc, Mutex, Weak},
};

use roomsync_core::{
    EngineError, ErrorCategory, PendingEventData, PendingEventEntry, RawEvent, SendOutcome,
    SendStatus, normalize_send_outcome,
};
use roomsync_store::StoreName;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pending_event::{Attachment, PendingEvent, wire_payload};
use crate::{
    api::{ApiError, map_api_error, retry_rate_limited},
    crypto::{RoomEncryption, map_crypto_error},
    lock,
    session::SessionContext,
    storage::{pending, write_txn},
};

/// Receives pending entry changes, e.g. an open timeline.
pub(crate) trait PendingObserver: Send + Sync {
    /// Entries present when the observer was attached.
    fn pending_attached(&self, entries: Vec<PendingEventEntry>);
    fn pending_updated(&self, entry: PendingEventEntry);
    fn pending_removed(&self, queue_index: u64);
}

#[derive(Default)]
struct QueueState {
    events: Vec<PendingEvent>,
    /// A drain task is running.
    sending: bool,
    /// Suspended after a transport failure until resumed.
    offline: bool,
    observer: Option<Weak<dyn PendingObserver>>,
}

impl QueueState {
    fn position(&self, queue_index: u64) -> Option<usize> {
        self.events
            .iter()
            .position(|event| event.data.queue_index == queue_index)
    }

    fn notify_updated(&self, event: &PendingEvent) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.pending_updated(event.entry());
        }
    }

    fn notify_removed(&self, queue_index: u64) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.pending_removed(queue_index);
        }
    }
}

/// Snapshot of the event being worked on by the drain task.
struct SendJob {
    data: PendingEventData,
    attachment: Option<Attachment>,
    abort: CancellationToken,
}

enum SendFailure {
    /// The server could not be reached; the queue goes offline.
    Offline(EngineError),
    /// The event was aborted or echoed while in flight.
    Aborted,
    Failed(EngineError),
}

pub(crate) struct SendQueue {
    room_id: String,
    context: Arc<SessionContext>,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
}

impl SendQueue {
    pub(crate) fn new(
        room_id: impl Into<String>,
        context: Arc<SessionContext>,
        stored: Vec<PendingEventData>,
    ) -> Arc<Self> {
        let mut events: Vec<PendingEvent> = stored.into_iter().map(PendingEvent::restore).collect();
        events.sort_by_key(|event| event.data.queue_index);
        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            room_id: room_id.into(),
            context,
            state: Mutex::new(QueueState {
                events,
                ..QueueState::default()
            }),
            idle,
        })
    }

    pub(crate) fn entries(&self) -> Vec<PendingEventEntry> {
        lock(&self.state).events.iter().map(PendingEvent::entry).collect()
    }

    /// Register `observer`, handing it the current entries first so no
    /// change is missed in between.
    pub(crate) fn attach(&self, observer: Weak<dyn PendingObserver>) {
        let mut state = lock(&self.state);
        if let Some(strong) = observer.upgrade() {
            strong.pending_attached(state.events.iter().map(PendingEvent::entry).collect());
        }
        state.observer = Some(observer);
    }

    pub(crate) fn detach(&self) {
        lock(&self.state).observer = None;
    }

    #[cfg(test)]
    pub(crate) fn is_offline(&self) -> bool {
        lock(&self.state).offline
    }

    /// Resolves once no drain task is running.
    pub(crate) async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Persist a new local event and start sending it.
    pub(crate) async fn enqueue(
        self: &Arc<Self>,
        event_type: &str,
        content: Value,
        attachment: Option<Attachment>,
        needs_encryption: bool,
    ) -> Result<PendingEventEntry, EngineError> {
        let room_id = self.room_id.as_str();
        let needs_upload = attachment.is_some();
        let data = write_txn(
            self.context.storage.as_ref(),
            &[StoreName::Session, StoreName::PendingEvents],
            "enqueue_pending",
            |txn| {
                let queue_index = pending::last_queue_index(txn, room_id)? + 1;
                pending::set_last_queue_index(txn, room_id, queue_index)?;
                let data = PendingEventData {
                    room_id: room_id.to_owned(),
                    queue_index,
                    event_type: event_type.to_owned(),
                    content,
                    txn_id: Uuid::new_v4().to_string(),
                    needs_encryption,
                    needs_upload,
                    encrypted_type: None,
                    encrypted_content: None,
                    remote_id: None,
                };
                pending::put(txn, &data)?;
                Ok(data)
            },
        )
        .await?;

        let entry = {
            let mut state = lock(&self.state);
            let position = state
                .events
                .partition_point(|event| event.data.queue_index < data.queue_index);
            let event = PendingEvent::new(data, attachment);
            let entry = event.entry();
            state.notify_updated(&event);
            state.events.insert(position, event);
            entry
        };
        info!(
            room_id,
            queue_index = entry.queue_index(),
            event_type,
            "queued local event"
        );
        self.kick();
        Ok(entry)
    }

    /// Leave offline mode and continue sending.
    pub(crate) fn resume(self: &Arc<Self>) {
        let was_offline = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut state.offline, false)
        };
        if was_offline {
            info!(room_id = %self.room_id, "resuming send queue");
        }
        self.kick();
    }

    /// Move an errored event back to waiting.
    pub(crate) fn retry(self: &Arc<Self>, queue_index: u64) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            let position = state
                .position(queue_index)
                .ok_or_else(|| unknown_pending(&self.room_id, queue_index))?;
            let event = &mut state.events[position];
            if event.status != SendStatus::Error {
                return Err(EngineError::new(
                    ErrorCategory::Config,
                    "pending_not_failed",
                    format!("pending event {queue_index} is {:?}, not in error", event.status),
                ));
            }
            event.status = SendStatus::Waiting;
            event.error = None;
            let event = &state.events[position];
            state.notify_updated(event);
        }
        self.kick();
        Ok(())
    }

    /// Drop a pending event that has not been sent yet.
    ///
    /// Returns `false` when there is nothing left to abort.
    pub(crate) async fn abort(&self, queue_index: u64) -> Result<bool, EngineError> {
        {
            let mut state = lock(&self.state);
            let Some(position) = state.position(queue_index) else {
                return Ok(false);
            };
            if state.events[position].status.is_final() {
                return Ok(false);
            }
            let event = state.events.remove(position);
            event.abort.cancel();
            state.notify_removed(queue_index);
        }
        info!(room_id = %self.room_id, queue_index, "aborted pending event");

        let room_id = self.room_id.as_str();
        write_txn(
            self.context.storage.as_ref(),
            &[StoreName::PendingEvents],
            "abort_pending",
            |txn| pending::remove(txn, room_id, queue_index),
        )
        .await?;
        Ok(true)
    }

    /// Queue indices of local events echoed by `events`.
    pub(crate) fn find_echoes(&self, events: &[RawEvent]) -> Vec<u64> {
        let state = lock(&self.state);
        events
            .iter()
            .filter_map(|remote| {
                state
                    .events
                    .iter()
                    .find(|local| local.is_echo(&remote.event_id, remote.transaction_id()))
                    .map(|local| local.data.queue_index)
            })
            .collect()
    }

    /// Forget events whose echo was committed.
    pub(crate) fn remove_echoed(&self, queue_indices: &[u64]) {
        let mut state = lock(&self.state);
        for &queue_index in queue_indices {
            if let Some(position) = state.position(queue_index) {
                let event = state.events.remove(position);
                event.abort.cancel();
                state.notify_removed(queue_index);
                debug!(room_id = %self.room_id, queue_index, "pending event echoed");
            }
        }
    }

    /// Spawn the drain task unless one is running or the queue is offline.
    fn kick(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.sending || state.offline || !state.events.iter().any(PendingEvent::is_sendable) {
                return;
            }
            state.sending = true;
            self.idle.send_replace(false);
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = lock(&self.state);
                let next = if state.offline {
                    None
                } else {
                    state.events.iter().find(|event| event.is_sendable()).map(|event| SendJob {
                        data: event.data.clone(),
                        attachment: event.attachment.clone(),
                        abort: event.abort.clone(),
                    })
                };
                match next {
                    Some(job) => job,
                    None => {
                        state.sending = false;
                        self.idle.send_replace(true);
                        return;
                    }
                }
            };

            let queue_index = job.data.queue_index;
            let txn_id = job.data.txn_id.clone();
            match self.send_one(job).await {
                Ok(event_id) => {
                    self.context.channels.emit(normalize_send_outcome(
                        &self.room_id,
                        txn_id,
                        queue_index,
                        SendOutcome::Success { event_id },
                    ));
                }
                Err(SendFailure::Aborted) => {
                    debug!(room_id = %self.room_id, queue_index, "send interrupted");
                }
                Err(SendFailure::Offline(error)) => {
                    warn!(
                        room_id = %self.room_id,
                        queue_index,
                        code = %error.code,
                        "send queue offline"
                    );
                    let mut state = lock(&self.state);
                    state.offline = true;
                    if let Some(position) = state.position(queue_index) {
                        state.events[position].status = SendStatus::Waiting;
                        let event = &state.events[position];
                        state.notify_updated(event);
                    }
                }
                Err(SendFailure::Failed(error)) => {
                    warn!(
                        room_id = %self.room_id,
                        queue_index,
                        code = %error.code,
                        "pending event failed"
                    );
                    self.set_status(queue_index, SendStatus::Error, Some(error.clone()));
                    self.context.channels.emit(normalize_send_outcome(
                        &self.room_id,
                        txn_id,
                        queue_index,
                        SendOutcome::Failure { error },
                    ));
                }
            }
        }
    }

    /// Upload, encrypt and send one event, persisting progress after each step.
    async fn send_one(&self, mut job: SendJob) -> Result<String, SendFailure> {
        let queue_index = job.data.queue_index;
        let api = Arc::clone(&self.context.api);
        let policy = self.context.config.retry_policy();

        if job.data.needs_upload {
            let attachment = job.attachment.take().ok_or_else(|| {
                SendFailure::Failed(EngineError::new(
                    ErrorCategory::Config,
                    "attachment_missing",
                    format!("attachment of pending event {queue_index} is no longer available"),
                ))
            })?;
            let (data, file_info) = if job.data.needs_encryption {
                self.set_status(queue_index, SendStatus::EncryptingAttachments, None);
                let encryption = self.encryption()?;
                let encrypted = cancellable(&job.abort, encryption.encrypt_attachment(attachment.data))
                    .await?
                    .map_err(|err| SendFailure::Failed(map_crypto_error("encrypt_attachment", err)))?;
                (encrypted.data, Some(encrypted.file_info))
            } else {
                (attachment.data, None)
            };

            self.set_status(queue_index, SendStatus::UploadingAttachments, None);
            let content_type = if file_info.is_some() {
                "application/octet-stream"
            } else {
                attachment.content_type.as_str()
            };
            let uri = cancellable(
                &job.abort,
                retry_rate_limited(&policy, "upload", || {
                    api.upload(&attachment.filename, content_type, data.clone())
                }),
            )
            .await?
            .map_err(|err| api_failure("upload", err))?;

            match file_info {
                Some(mut file) => {
                    set_field(&mut file, "url", Value::String(uri))?;
                    set_field(&mut job.data.content, "file", file)?;
                }
                None => set_field(&mut job.data.content, "url", Value::String(uri))?,
            }
            job.data.needs_upload = false;
            self.persist(&job.data, SendStatus::UploadingAttachments).await?;
        }

        if job.data.needs_encryption && job.data.encrypted_content.is_none() {
            self.set_status(queue_index, SendStatus::Encrypting, None);
            let encryption = self.encryption()?;
            let encrypted = cancellable(
                &job.abort,
                encryption.encrypt(&self.room_id, &job.data.event_type, &job.data.content),
            )
            .await?
            .map_err(|err| SendFailure::Failed(map_crypto_error("encrypt", err)))?;
            job.data.encrypted_type = Some(encrypted.event_type);
            job.data.encrypted_content = Some(encrypted.content);
            self.persist(&job.data, SendStatus::Encrypting).await?;
        }

        self.set_status(queue_index, SendStatus::Sending, None);
        let (event_type, content) = wire_payload(&job.data);
        let txn_id = job.data.txn_id.as_str();
        let event_id = cancellable(
            &job.abort,
            retry_rate_limited(&policy, "send", || {
                api.send(&self.room_id, event_type, txn_id, content)
            }),
        )
        .await?
        .map_err(|err| api_failure("send", err))?;

        info!(room_id = %self.room_id, queue_index, event_id = %event_id, "pending event sent");
        job.data.remote_id = Some(event_id.clone());
        self.persist(&job.data, SendStatus::Sent).await?;
        Ok(event_id)
    }

    fn encryption(&self) -> Result<Arc<dyn RoomEncryption>, SendFailure> {
        self.context.encryption.clone().ok_or_else(|| {
            SendFailure::Failed(EngineError::new(
                ErrorCategory::Crypto,
                "encryption_unavailable",
                format!("{} is encrypted but no encryption is configured", self.room_id),
            ))
        })
    }

    fn set_status(&self, queue_index: u64, status: SendStatus, error: Option<EngineError>) {
        let mut state = lock(&self.state);
        if let Some(position) = state.position(queue_index) {
            let event = &mut state.events[position];
            event.status = status;
            event.error = error;
            let event = &state.events[position];
            state.notify_updated(event);
        }
    }

    /// Store progress unless the event is gone, e.g. because its echo already
    /// removed it.
    async fn persist(&self, data: &PendingEventData, status: SendStatus) -> Result<(), SendFailure> {
        let stored = write_txn(
            self.context.storage.as_ref(),
            &[StoreName::PendingEvents],
            "persist_pending",
            |txn| {
                if pending::get(txn, &data.room_id, data.queue_index)?.is_none() {
                    return Ok(false);
                }
                pending::put(txn, data)?;
                Ok(true)
            },
        )
        .await
        .map_err(SendFailure::Failed)?;

        if !stored {
            debug!(
                room_id = %self.room_id,
                queue_index = data.queue_index,
                "pending event removed while sending"
            );
            return Ok(());
        }
        let mut state = lock(&self.state);
        if let Some(position) = state.position(data.queue_index) {
            let event = &mut state.events[position];
            event.data = data.clone();
            event.status = status;
            let event = &state.events[position];
            state.notify_updated(event);
        }
        Ok(())
    }
}

async fn cancellable<F: Future>(abort: &CancellationToken, work: F) -> Result<F::Output, SendFailure> {
    tokio::select! {
        _ = abort.cancelled() => Err(SendFailure::Aborted),
        output = work => Ok(output),
    }
}

fn api_failure(operation: &str, err: ApiError) -> SendFailure {
    let transport = err.is_transport();
    let mapped = map_api_error(operation, err);
    if transport {
        SendFailure::Offline(mapped)
    } else {
        SendFailure::Failed(mapped)
    }
}

fn set_field(target: &mut Value, field: &str, value: Value) -> Result<(), SendFailure> {
    let object = target.as_object_mut().ok_or_else(|| {
        SendFailure::Failed(EngineError::new(
            ErrorCategory::Config,
            "invalid_content",
            format!("cannot set '{field}' on non-object event content"),
        ))
    })?;
    object.insert(field.to_owned(), value);
    Ok(())
}

fn unknown_pending(room_id: &str, queue_index: u64) -> EngineError {
    EngineError::new(
        ErrorCategory::Config,
        "unknown_pending_event",
        format!("{room_id} has no pending event {queue_index}"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use roomsync_core::EngineEvent;
    use roomsync_store::Storage;
    use serde_json::json;

    use super::*;
    use crate::test_utils::{MockEncryption, MockHomeServer, test_context, wait_until};

    const ROOM: &str = "!room:example.org";

    fn text(body: &str) -> Value {
        json!({"msgtype": "m.text", "body": body})
    }

    #[derive(Default)]
    struct RecordingObserver {
        updates: Mutex<Vec<(u64, SendStatus)>>,
        removals: AtomicUsize,
    }

    impl PendingObserver for RecordingObserver {
        fn pending_attached(&self, _entries: Vec<PendingEventEntry>) {}

        fn pending_updated(&self, entry: PendingEventEntry) {
            lock(&self.updates).push((entry.queue_index(), entry.status));
        }

        fn pending_removed(&self, _queue_index: u64) {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sends_in_queue_order_and_acks() {
        let api = MockHomeServer::new();
        let context = test_context(api.clone(), None);
        let mut events = context.channels.subscribe();
        let queue = SendQueue::new(ROOM, context, Vec::new());

        let first = queue.enqueue("m.room.message", text("one"), None, false).await.expect("enqueue");
        let second = queue.enqueue("m.room.message", text("two"), None, false).await.expect("enqueue");
        assert_eq!(first.queue_index(), 1);
        assert_eq!(second.queue_index(), 2);
        queue.wait_idle().await;

        let sent: Vec<_> = api.send_attempts().into_iter().map(|s| s.txn_id).collect();
        assert_eq!(sent, [first.txn_id().to_owned(), second.txn_id().to_owned()]);
        assert!(queue.entries().iter().all(|e| e.status == SendStatus::Sent));

        match events.recv().await.expect("ack") {
            EngineEvent::SendAck(ack) => {
                assert_eq!(ack.queue_index, 1);
                assert!(ack.event_id.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_suspends_queue_until_resume() {
        let api = MockHomeServer::new();
        api.fail_next_send(ApiError::Connection("reset".into()));
        let queue = SendQueue::new(ROOM, test_context(api.clone(), None), Vec::new());

        let first = queue.enqueue("m.room.message", text("1"), None, false).await.expect("enqueue");
        queue.wait_idle().await;
        assert!(queue.is_offline());
        let second = queue.enqueue("m.room.message", text("2"), None, false).await.expect("enqueue");
        let third = queue.enqueue("m.room.message", text("3"), None, false).await.expect("enqueue");
        queue.wait_idle().await;
        assert_eq!(api.send_attempts().len(), 1);
        assert!(queue.entries().iter().all(|e| e.status == SendStatus::Waiting));

        queue.resume();
        wait_until(|| async { api.send_attempts().len() == 4 }).await;
        queue.wait_idle().await;

        let order: Vec<_> = api.send_attempts().into_iter().map(|s| s.txn_id).collect();
        assert_eq!(
            order,
            [first.txn_id(), first.txn_id(), second.txn_id(), third.txn_id()]
        );
        assert_eq!(api.distinct_events_sent(), 3);
    }

    #[tokio::test]
    async fn rejected_event_errors_and_queue_moves_on() {
        let api = MockHomeServer::new();
        api.fail_next_send(ApiError::Rejected {
            status: 403,
            errcode: "M_FORBIDDEN".into(),
            message: "no".into(),
        });
        let queue = SendQueue::new(ROOM, test_context(api.clone(), None), Vec::new());

        let first = queue.enqueue("m.room.message", text("1"), None, false).await.expect("enqueue");
        queue.enqueue("m.room.message", text("2"), None, false).await.expect("enqueue");
        wait_until(|| async { api.send_attempts().len() == 2 }).await;
        queue.wait_idle().await;

        let statuses: Vec<_> = queue.entries().iter().map(|e| e.status).collect();
        assert_eq!(statuses, [SendStatus::Error, SendStatus::Sent]);
        let failed = &queue.entries()[0];
        assert_eq!(failed.error.as_ref().map(|e| e.code.as_str()), Some("M_FORBIDDEN"));

        queue.retry(first.queue_index()).expect("retry");
        queue.wait_idle().await;
        wait_until(|| async { queue.entries()[0].status == SendStatus::Sent }).await;
    }

    #[tokio::test]
    async fn encrypts_before_sending_and_persists_progress() {
        let api = MockHomeServer::new();
        let context = test_context(api.clone(), Some(MockEncryption::new()));
        let storage = Arc::clone(&context.storage);
        let queue = SendQueue::new(ROOM, context, Vec::new());

        let entry = queue.enqueue("m.room.message", text("secret"), None, true).await.expect("enqueue");
        queue.wait_idle().await;

        let attempt = &api.send_attempts()[0];
        assert_eq!(attempt.event_type, "m.room.encrypted");
        assert_eq!(attempt.content["event_type"], "m.room.message");

        let txn = storage.read_txn(&[StoreName::PendingEvents]).await.expect("open");
        let stored = pending::get(txn.as_ref(), ROOM, entry.queue_index())
            .expect("read")
            .expect("still pending until echo");
        assert!(stored.encrypted_content.is_some());
        assert!(stored.remote_id.is_some());
    }

    #[tokio::test]
    async fn uploads_encrypted_attachment_into_content() {
        let api = MockHomeServer::new();
        let queue = SendQueue::new(ROOM, test_context(api.clone(), Some(MockEncryption::new())), Vec::new());
        let attachment = Attachment {
            filename: "cat.png".into(),
            content_type: "image/png".into(),
            data: vec![1, 2, 3],
        };

        queue
            .enqueue("m.room.message", json!({"msgtype": "m.image"}), Some(attachment), true)
            .await
            .expect("enqueue");
        queue.wait_idle().await;

        let uploads = api.uploads();
        assert_eq!(uploads[0].data, vec![3, 2, 1]);
        assert_eq!(uploads[0].content_type, "application/octet-stream");
        let sent = &api.send_attempts()[0];
        let inner: Value = serde_json::from_str(sent.content["ciphertext"].as_str().expect("ciphertext"))
            .expect("mock ciphertext is json");
        assert_eq!(inner["file"]["url"], "mxc://mock/1");
        assert_eq!(inner["file"]["key"], "k");
    }

    #[tokio::test]
    async fn restored_upload_without_attachment_fails() {
        let api = MockHomeServer::new();
        let stored = PendingEventData {
            room_id: ROOM.into(),
            queue_index: 4,
            event_type: "m.room.message".into(),
            content: json!({"msgtype": "m.file"}),
            txn_id: "txn-4".into(),
            needs_encryption: false,
            needs_upload: true,
            encrypted_type: None,
            encrypted_content: None,
            remote_id: None,
        };
        let queue = SendQueue::new(ROOM, test_context(api.clone(), None), vec![stored]);

        queue.resume();
        queue.wait_idle().await;

        let entry = &queue.entries()[0];
        assert_eq!(entry.status, SendStatus::Error);
        assert_eq!(entry.error.as_ref().map(|e| e.code.as_str()), Some("attachment_missing"));
        assert!(api.send_attempts().is_empty());
    }

    #[tokio::test]
    async fn encrypted_room_without_encryption_errors() {
        let api = MockHomeServer::new();
        let queue = SendQueue::new(ROOM, test_context(api.clone(), None), Vec::new());

        queue.enqueue("m.room.message", text("x"), None, true).await.expect("enqueue");
        queue.wait_idle().await;

        let entry = &queue.entries()[0];
        assert_eq!(entry.error.as_ref().map(|e| e.code.as_str()), Some("encryption_unavailable"));
    }

    #[tokio::test]
    async fn abort_removes_waiting_event_from_store_and_observer() {
        let api = MockHomeServer::new();
        api.fail_next_send(ApiError::Timeout);
        let context = test_context(api.clone(), None);
        let storage = Arc::clone(&context.storage);
        let queue = SendQueue::new(ROOM, context, Vec::new());
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn PendingObserver> = Arc::downgrade(&observer) as Weak<dyn PendingObserver>;
        queue.attach(weak);

        let entry = queue.enqueue("m.room.message", text("x"), None, false).await.expect("enqueue");
        queue.wait_idle().await;
        assert!(queue.abort(entry.queue_index()).await.expect("abort"));
        assert!(!queue.abort(entry.queue_index()).await.expect("second abort"));

        assert!(queue.entries().is_empty());
        assert_eq!(observer.removals.load(Ordering::SeqCst), 1);
        assert!(lock(&observer.updates).iter().any(|(_, s)| *s == SendStatus::Sending));
        let txn = storage.read_txn(&[StoreName::PendingEvents]).await.expect("open");
        assert!(pending::all(txn.as_ref(), ROOM).expect("scan").is_empty());
    }

    #[tokio::test]
    async fn queue_indices_are_not_reused_after_draining() {
        let api = MockHomeServer::new();
        let context = test_context(api.clone(), None);
        let queue = SendQueue::new(ROOM, Arc::clone(&context), Vec::new());
        let first = queue.enqueue("m.room.message", text("1"), None, false).await.expect("enqueue");
        queue.wait_idle().await;
        queue.remove_echoed(&[first.queue_index()]);

        let reloaded = SendQueue::new(ROOM, context, Vec::new());
        let second = reloaded.enqueue("m.room.message", text("2"), None, false).await.expect("enqueue");
        assert_eq!(second.queue_index(), 2);
    }

    #[test]
    fn finds_echoes_by_transaction_id() {
        let api = MockHomeServer::new();
        let stored = PendingEventData {
            room_id: ROOM.into(),
            queue_index: 7,
            event_type: "m.room.message".into(),
            content: json!({}),
            txn_id: "txn-7".into(),
            needs_encryption: false,
            needs_upload: false,
            encrypted_type: None,
            encrypted_content: None,
            remote_id: None,
        };
        let queue = SendQueue::new(ROOM, test_context(api, None), vec![stored]);
        let echo: RawEvent = serde_json::from_value(json!({
            "event_id": "$e",
            "type": "m.room.message",
            "sender": "@me:example.org",
            "unsigned": {"transaction_id": "txn-7"}
        }))
        .expect("event");

        assert_eq!(queue.find_echoes(&[echo]), [7]);
        queue.remove_echoed(&[7]);
        assert!(queue.entries().is_empty());
    }
}
