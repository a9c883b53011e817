//! The replication loop: long-poll, prepare, write, apply.

use std::{sync::Arc, time::Duration};

use roomsync_core::{
    ConnectionStatus, EngineError, EngineEvent, ErrorCategory, RetryPolicy, SyncResponse,
    SyncSnapshot, SyncStateMachine, normalize_fatal_error,
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    api::{ApiError, SyncRequest, map_api_error},
    session::Session,
};

/// Why one iteration did not complete.
#[derive(Debug)]
pub(crate) enum SyncError {
    Api(ApiError),
    Engine(EngineError),
    Cancelled,
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        SyncError::Api(err)
    }
}

impl From<EngineError> for SyncError {
    fn from(err: EngineError) -> Self {
        SyncError::Engine(err)
    }
}

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of a session's sync task and its observable status.
#[derive(Debug)]
pub(crate) struct SyncLoop {
    task: Mutex<Option<RunningSyncTask>>,
    status: Arc<watch::Sender<SyncSnapshot>>,
}

impl SyncLoop {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(SyncSnapshot::default());
        Self {
            task: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub(crate) fn snapshot(&self) -> SyncSnapshot {
        self.status.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.status.subscribe()
    }

    pub(crate) async fn start(&self, session: Arc<Session>) -> Result<(), EngineError> {
        let mut guard = self.task.lock().await;
        if guard
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return Err(EngineError::new(
                ErrorCategory::Internal,
                "sync_already_running",
                "sync task is already running",
            ));
        }

        let mut machine = SyncStateMachine::default();
        machine.start(session.sync_token().is_some())?;
        let stop = CancellationToken::new();
        let runner = SyncRunner {
            policy: session.config().retry_policy(),
            session,
            machine,
            status: Arc::clone(&self.status),
            stop: stop.child_token(),
        };
        runner.publish(ConnectionStatus::Online, None);
        info!(status = ?runner.machine.status(), "sync loop starting");

        let task = tokio::spawn(runner.run());
        *guard = Some(RunningSyncTask { stop, task });
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<(), EngineError> {
        let running = {
            let mut guard = self.task.lock().await;
            guard.take()
        };

        let Some(running) = running else {
            return Err(EngineError::new(
                ErrorCategory::Internal,
                "sync_not_running",
                "sync task is not running",
            ));
        };

        running.stop.cancel();
        running.task.await.map_err(|err| {
            EngineError::new(
                ErrorCategory::Internal,
                "sync_task_failed",
                format!("sync task ended abnormally: {err}"),
            )
        })
    }
}

struct SyncRunner {
    session: Arc<Session>,
    machine: SyncStateMachine,
    status: Arc<watch::Sender<SyncSnapshot>>,
    stop: CancellationToken,
    policy: RetryPolicy,
}

impl SyncRunner {
    async fn run(mut self) {
        let threshold = self.session.config().catchup_to_device_threshold;
        let mut transport_failures: u32 = 0;
        let mut rate_limited: u32 = 0;
        let mut failure: Option<EngineError> = None;

        loop {
            match self.iteration().await {
                Ok(to_device_count) => {
                    transport_failures = 0;
                    rate_limited = 0;
                    // A completed request proves the server is reachable again.
                    let session = Arc::clone(&self.session);
                    tokio::spawn(async move { session.resume_send_queues().await });
                    if let Err(err) = self.machine.on_sync_completed(to_device_count, threshold) {
                        failure = Some(err);
                        break;
                    }
                    self.publish(ConnectionStatus::Online, None);
                }
                Err(SyncError::Cancelled) => break,
                Err(SyncError::Api(err)) if err.is_transport() => {
                    let delay = self.policy.delay_for_attempt(transport_failures, None);
                    transport_failures = transport_failures.saturating_add(1);
                    let retry_in_ms = delay.as_millis() as u64;
                    warn!(
                        attempt = transport_failures,
                        retry_in_ms,
                        error = %err,
                        "sync request failed, reconnecting"
                    );
                    self.publish(
                        ConnectionStatus::Reconnecting {
                            attempt: transport_failures,
                            retry_in_ms,
                        },
                        None,
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
                Err(SyncError::Api(ApiError::RateLimited { retry_after_ms }))
                    if self.policy.allows_rate_limit_retry(rate_limited) =>
                {
                    let delay = self.policy.delay_for_attempt(rate_limited, retry_after_ms);
                    rate_limited = rate_limited.saturating_add(1);
                    warn!(
                        attempt = rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        "sync rate limited"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
                Err(SyncError::Api(err)) => {
                    failure = Some(map_api_error("sync", err));
                    break;
                }
                Err(SyncError::Engine(err)) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Err(err) = self.machine.stop() {
            warn!(code = %err.code, message = %err.message, "sync state machine refused to stop");
        }
        match failure {
            Some(err) => {
                error!(
                    code = %err.code,
                    category = ?err.category,
                    message = %err.message,
                    "sync loop stopped on error"
                );
                self.publish(ConnectionStatus::Online, Some(err.clone()));
                let recoverable = err.is_transient();
                self.session.emit(normalize_fatal_error(err, recoverable));
            }
            None => {
                info!("sync loop stopped");
                self.publish(ConnectionStatus::Online, None);
            }
        }
    }

    /// One request/prepare/write/apply cycle. Only the request is cancelled
    /// by `stop`; a received response is always written.
    async fn iteration(&self) -> Result<usize, SyncError> {
        let config = self.session.config();
        let timeout_ms = self.machine.timeout_ms(config.sync_timeout_ms);
        let request_timeout = Duration::from_millis(config.request_timeout_ms(timeout_ms));
        let since = self.session.sync_token();

        let response = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(SyncError::Cancelled),
            response = self.request(since.clone(), timeout_ms, request_timeout) => response?,
        };

        let to_device_count = response.to_device.events.len();
        debug!(
            next_batch = %response.next_batch,
            joined = response.rooms.join.len(),
            to_device_count,
            "sync response received"
        );
        let preparation = self.session.prepare_sync(response).await?;
        let changes = self.session.write_sync(preparation, since.as_deref()).await?;
        self.session.after_sync(changes).await;
        Ok(to_device_count)
    }

    async fn request(
        &self,
        since: Option<String>,
        timeout_ms: u64,
        request_timeout: Duration,
    ) -> Result<SyncResponse, SyncError> {
        let filter_id = self.session.ensure_filter().await?;
        let request = SyncRequest {
            since,
            filter_id: Some(filter_id),
            timeout_ms,
        };
        match tokio::time::timeout(request_timeout, self.session.api().sync(request)).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(SyncError::Api(ApiError::Timeout)),
        }
    }

    /// Sleep unless stopped first; `false` when stopped.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn publish(&self, connection: ConnectionStatus, error: Option<EngineError>) {
        let snapshot = SyncSnapshot {
            status: self.machine.status(),
            connection,
            error,
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if changed {
            self.session
                .emit(EngineEvent::SyncStateChanged(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use roomsync_core::{SendStatus, SyncStatus, event_types};
    use roomsync_store::{MemoryStorage, Storage};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::test_utils::{MockHomeServer, joined, test_session, wait_until};

    const ROOM: &str = "!room:example.org";

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new())
    }

    async fn next_state(events: &mut roomsync_core::EventStream) -> SyncSnapshot {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event");
            if let EngineEvent::SyncStateChanged(snapshot) = event {
                return snapshot;
            }
        }
    }

    #[tokio::test]
    async fn syncs_with_filter_and_advances_the_token() {
        let api = MockHomeServer::new();
        api.push_sync(joined("s1", ROOM, Vec::new(), false, Some("p1")));
        api.push_sync(joined("s2", ROOM, Vec::new(), false, None));
        let session = test_session(storage(), api.clone(), None).await;

        session.start_sync().await.expect("start");
        wait_until(|| {
            let api = api.clone();
            async move { api.sync_requests().len() >= 3 }
        })
        .await;
        session.stop_sync().await.expect("stop");

        let requests = api.sync_requests();
        assert_eq!(requests[0].since, None);
        assert_eq!(requests[0].filter_id.as_deref(), Some("filter1"));
        assert_eq!(requests[0].timeout_ms, 0);
        assert_eq!(requests[1].since.as_deref(), Some("s1"));
        assert_eq!(requests[2].since.as_deref(), Some("s2"));
        // Catch-up sync without to-device traffic switches to long polling.
        assert_eq!(requests[2].timeout_ms, session.config().sync_timeout_ms);
        assert_eq!(api.filters_created(), 1);
        assert_eq!(session.sync_token().as_deref(), Some("s2"));
        assert!(session.room(ROOM).await.is_some());
        assert_eq!(session.sync_status().status, SyncStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_back_off_and_retry_the_same_token() {
        let api = MockHomeServer::new();
        api.push_sync_error(ApiError::Connection("reset".into()));
        api.push_sync_error(ApiError::Timeout);
        api.push_sync(joined("s1", ROOM, Vec::new(), false, None));
        let session = test_session(storage(), api.clone(), None).await;
        let mut events = session.subscribe();

        session.start_sync().await.expect("start");
        assert_eq!(next_state(&mut events).await.status, SyncStatus::InitialSync);
        let first = next_state(&mut events).await;
        assert_eq!(
            first.connection,
            ConnectionStatus::Reconnecting {
                attempt: 1,
                retry_in_ms: 10
            }
        );
        let second = next_state(&mut events).await;
        assert_eq!(
            second.connection,
            ConnectionStatus::Reconnecting {
                attempt: 2,
                retry_in_ms: 20
            }
        );
        let online = next_state(&mut events).await;
        assert_eq!(online.connection, ConnectionStatus::Online);
        assert_eq!(online.status, SyncStatus::CatchupSync);
        session.stop_sync().await.expect("stop");

        let requests = api.sync_requests();
        assert!(requests[..3].iter().all(|request| request.since.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_stops_the_loop() {
        let api = MockHomeServer::new();
        for _ in 0..3 {
            api.push_sync_error(ApiError::RateLimited {
                retry_after_ms: Some(50),
            });
        }
        let session = test_session(storage(), api.clone(), None).await;
        let mut events = session.subscribe();

        session.start_sync().await.expect("start");
        let fatal = loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event");
            if let EngineEvent::FatalError { code, .. } = event {
                break code;
            }
        };
        assert_eq!(fatal, "rate_limited");
        assert_eq!(api.sync_requests().len(), 3);

        let status = session.sync_status();
        assert_eq!(status.status, SyncStatus::Stopped);
        assert_eq!(
            status.error.map(|err| err.category),
            Some(ErrorCategory::RateLimited)
        );

        // Stopping a loop that ended on its own joins it.
        session.stop_sync().await.expect("join");
        session.start_sync().await.expect("restart");
        session.stop_sync().await.expect("stop");
    }

    #[tokio::test]
    async fn rejected_sync_is_terminal() {
        let api = MockHomeServer::new();
        api.push_sync_error(ApiError::Rejected {
            status: 401,
            errcode: "M_UNKNOWN_TOKEN".into(),
            message: "logged out".into(),
        });
        let session = test_session(storage(), api.clone(), None).await;
        let mut status = session.watch_sync_status();

        session.start_sync().await.expect("start");
        let stopped = timeout(
            Duration::from_secs(2),
            status.wait_for(|snapshot| snapshot.error.is_some()),
        )
        .await
        .expect("status timeout")
        .expect("status")
        .clone();
        assert_eq!(stopped.status, SyncStatus::Stopped);
        let error = stopped.error.expect("error");
        assert_eq!(error.category, ErrorCategory::Auth);
        assert_eq!(error.code, "M_UNKNOWN_TOKEN");
    }

    #[tokio::test]
    async fn start_and_stop_are_guarded() {
        let session = test_session(storage(), MockHomeServer::new(), None).await;

        let err = session.stop_sync().await.expect_err("not running");
        assert_eq!(err.code, "sync_not_running");

        session.start_sync().await.expect("start");
        let err = session.start_sync().await.expect_err("already running");
        assert_eq!(err.code, "sync_already_running");

        // The pending long poll is cancelled by stop.
        timeout(Duration::from_secs(2), session.stop_sync())
            .await
            .expect("stop timeout")
            .expect("stop");
        assert_eq!(session.sync_status().status, SyncStatus::Stopped);
    }

    #[tokio::test]
    async fn offline_send_queue_resumes_after_sync_succeeds() {
        let api = MockHomeServer::new();
        let store = storage();
        api.push_sync(joined("s1", ROOM, Vec::new(), false, None));
        let session = test_session(Arc::clone(&store), api.clone(), None).await;
        session.start_sync().await.expect("start");
        wait_until(|| {
            let session = Arc::clone(&session);
            async move { session.room(ROOM).await.is_some() }
        })
        .await;
        session.stop_sync().await.expect("stop");

        let room = session.room(ROOM).await.expect("room");
        api.fail_next_send(ApiError::Connection("down".into()));
        room.send_event(event_types::MESSAGE, json!({"body": "later"}))
            .await
            .expect("enqueue");
        room.wait_send_idle().await;
        assert_eq!(room.pending_entries()[0].status, SendStatus::Waiting);
        assert_eq!(api.distinct_events_sent(), 0);

        api.push_sync(joined("s2", ROOM, Vec::new(), false, None));
        session.start_sync().await.expect("restart");
        wait_until(|| {
            let api = api.clone();
            async move { api.distinct_events_sent() == 1 }
        })
        .await;
        session.stop_sync().await.expect("stop");
        assert_eq!(api.send_attempts().len(), 2);
    }

    #[tokio::test]
    async fn dropped_send_is_retried_by_the_next_successful_sync() {
        let api = MockHomeServer::new();
        api.push_sync(joined("s1", ROOM, Vec::new(), false, None));
        let session = test_session(storage(), api.clone(), None).await;
        session.start_sync().await.expect("start");
        wait_until(|| {
            let session = Arc::clone(&session);
            async move { session.room(ROOM).await.is_some() }
        })
        .await;

        let room = session.room(ROOM).await.expect("room");
        api.fail_next_send(ApiError::Connection("blip".into()));
        room.send_event(event_types::MESSAGE, json!({"body": "again"}))
            .await
            .expect("enqueue");
        room.wait_send_idle().await;
        assert_eq!(room.pending_entries()[0].status, SendStatus::Waiting);
        assert_eq!(api.distinct_events_sent(), 0);

        // The loop keeps running; the next response alone must resume sending.
        api.push_sync(joined("s2", ROOM, Vec::new(), false, None));
        wait_until(|| {
            let api = api.clone();
            async move { api.distinct_events_sent() == 1 }
        })
        .await;
        assert_eq!(session.sync_token().as_deref(), Some("s2"));
        assert_eq!(api.send_attempts().len(), 2);
        assert!(session.sync_status().status != SyncStatus::Stopped);
        session.stop_sync().await.expect("stop");
    }
}
