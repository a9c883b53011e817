mod logging;
mod loopback;

use std::{future::Future, sync::Arc, time::Duration};

use roomsync_core::{EngineError, EngineEvent, ErrorCategory, event_types};
use roomsync_engine::{EngineConfig, Session, SessionConfig};
use roomsync_store::{MemoryStorage, Storage};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::loopback::LoopbackServer;

const ROOM_ID: &str = "!smoke:loopback";
const USER_ID: &str = "@smoke:loopback";
const SEEDED_EVENTS: usize = 40;
const SENT_EVENTS: usize = 3;
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

struct Report {
    room_name: Option<String>,
    events: usize,
    pages: usize,
    sent: usize,
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    match run(config).await {
        Ok(report) => {
            println!(
                "Replicated {} events of {:?} ({} backfill pages), {} local events echoed.",
                report.events,
                report.room_name.as_deref().unwrap_or(ROOM_ID),
                report.pages,
                report.sent
            );
        }
        Err(err) => {
            eprintln!("Smoke run failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(config: EngineConfig) -> Result<Report, EngineError> {
    let server = Arc::new(LoopbackServer::new(
        ROOM_ID,
        USER_ID,
        "Smoke room",
        SEEDED_EVENTS,
    ));
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let session = Session::load(SessionConfig::new(USER_ID, storage, server, config)).await?;
    tokio::spawn(log_events(Arc::clone(&session)));

    session.start_sync().await?;
    let room = within("room to appear", async {
        loop {
            if let Some(room) = session.room(ROOM_ID).await {
                return room;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    let timeline = room.open_timeline().await?;
    let mut pages = 0;
    while !timeline.load_at_top(10).await? {
        pages += 1;
    }

    for n in 0..SENT_EVENTS {
        room.send_event(
            event_types::MESSAGE,
            json!({"msgtype": "m.text", "body": format!("smoke {n}")}),
        )
        .await?;
    }
    within("local echoes", async {
        while !room.pending_entries().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    let events = timeline
        .entries()
        .iter()
        .filter(|entry| entry.as_event().is_some())
        .count();
    timeline.close().await;
    session.stop_sync().await?;

    Ok(Report {
        room_name: room.summary().name,
        events,
        pages,
        sent: SENT_EVENTS,
    })
}

async fn within<T>(what: &str, step: impl Future<Output = T>) -> Result<T, EngineError> {
    tokio::time::timeout(STEP_TIMEOUT, step).await.map_err(|_| {
        EngineError::new(
            ErrorCategory::Internal,
            "smoke_timeout",
            format!("timed out waiting for {what}"),
        )
    })
}

async fn log_events(session: Arc<Session>) {
    let mut events = session.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::SyncStateChanged(snapshot)) => {
                info!(status = ?snapshot.status, connection = ?snapshot.connection, "sync state");
            }
            Ok(EngineEvent::RoomAdded { room_id }) => info!(room_id = %room_id, "room added"),
            Ok(EngineEvent::RoomUpdated(summary)) => {
                info!(room_id = %summary.room_id, name = ?summary.name, "room updated");
            }
            Ok(EngineEvent::SendAck(ack)) => {
                info!(
                    queue_index = ack.queue_index,
                    event_id = ?ack.event_id,
                    error = ?ack.error_code,
                    "send ack"
                );
            }
            Ok(EngineEvent::FatalError { code, message, .. }) => {
                warn!(code = %code, message = %message, "engine error");
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
