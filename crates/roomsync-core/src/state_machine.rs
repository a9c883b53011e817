use crate::{error::EngineError, types::SyncStatus};

/// Phase bookkeeping for the sync loop.
///
/// The loop owns one of these; every transition either returns the new status
/// or an `invalid_state_transition` error.
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    status: SyncStatus,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self {
            status: SyncStatus::Stopped,
        }
    }
}

impl SyncStateMachine {
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status != SyncStatus::Stopped
    }

    /// Long-poll timeout for the next request.
    pub fn timeout_ms(&self, sync_timeout_ms: u64) -> u64 {
        match self.status {
            SyncStatus::Syncing => sync_timeout_ms,
            _ => 0,
        }
    }

    /// Enter the first running phase.
    pub fn start(&mut self, has_sync_token: bool) -> Result<SyncStatus, EngineError> {
        let next = if has_sync_token {
            SyncStatus::CatchupSync
        } else {
            SyncStatus::InitialSync
        };
        self.transition_from_state(SyncStatus::Stopped, next, "start")
    }

    /// Advance after a committed iteration.
    pub fn on_sync_completed(
        &mut self,
        to_device_count: usize,
        catchup_threshold: usize,
    ) -> Result<SyncStatus, EngineError> {
        let next = match self.status {
            SyncStatus::InitialSync => SyncStatus::CatchupSync,
            SyncStatus::CatchupSync if to_device_count == 0 => SyncStatus::Syncing,
            SyncStatus::CatchupSync => SyncStatus::CatchupSync,
            SyncStatus::Syncing if to_device_count >= catchup_threshold.max(1) => {
                SyncStatus::CatchupSync
            }
            SyncStatus::Syncing => SyncStatus::Syncing,
            SyncStatus::Stopped => {
                return Err(EngineError::invalid_state(self.status, "on_sync_completed"));
            }
        };
        self.status = next;
        Ok(next)
    }

    pub fn stop(&mut self) -> Result<SyncStatus, EngineError> {
        self.transition_from_any_of(
            &[
                SyncStatus::InitialSync,
                SyncStatus::CatchupSync,
                SyncStatus::Syncing,
            ],
            SyncStatus::Stopped,
            "stop",
        )
    }

    fn transition_from_state(
        &mut self,
        expected: SyncStatus,
        next: SyncStatus,
        action: &str,
    ) -> Result<SyncStatus, EngineError> {
        if self.status != expected {
            return Err(EngineError::invalid_state(self.status, action));
        }
        self.status = next;
        Ok(next)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SyncStatus],
        next: SyncStatus,
        action: &str,
    ) -> Result<SyncStatus, EngineError> {
        if !expected.contains(&self.status) {
            return Err(EngineError::invalid_state(self.status, action));
        }
        self.status = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_goes_through_initial_then_catchup_then_live() {
        let mut sm = SyncStateMachine::default();

        assert_eq!(sm.start(false), Ok(SyncStatus::InitialSync));
        assert_eq!(sm.timeout_ms(30_000), 0);

        assert_eq!(sm.on_sync_completed(3, 100), Ok(SyncStatus::CatchupSync));
        assert_eq!(sm.on_sync_completed(7, 100), Ok(SyncStatus::CatchupSync));
        assert_eq!(sm.on_sync_completed(0, 100), Ok(SyncStatus::Syncing));
        assert_eq!(sm.timeout_ms(30_000), 30_000);
    }

    #[test]
    fn stored_token_starts_in_catchup() {
        let mut sm = SyncStateMachine::default();
        assert_eq!(sm.start(true), Ok(SyncStatus::CatchupSync));
    }

    #[test]
    fn device_backlog_drops_back_to_catchup() {
        let mut sm = SyncStateMachine::default();
        sm.start(true).expect("start");
        sm.on_sync_completed(0, 100).expect("live");

        assert_eq!(sm.on_sync_completed(99, 100), Ok(SyncStatus::Syncing));
        assert_eq!(sm.on_sync_completed(100, 100), Ok(SyncStatus::CatchupSync));
    }

    #[test]
    fn rejects_double_start_and_stop_when_stopped() {
        let mut sm = SyncStateMachine::default();
        let err = sm.stop().expect_err("nothing to stop");
        assert_eq!(err.code, "invalid_state_transition");

        sm.start(false).expect("start");
        let err = sm.start(false).expect_err("already running");
        assert_eq!(err.code, "invalid_state_transition");

        assert_eq!(sm.stop(), Ok(SyncStatus::Stopped));
        assert!(!sm.is_running());
        assert!(sm.on_sync_completed(0, 100).is_err());
    }

    #[test]
    fn stops_from_every_running_phase() {
        for completed in 0..3 {
            let mut sm = SyncStateMachine::default();
            sm.start(false).expect("start");
            for _ in 0..completed {
                sm.on_sync_completed(0, 100).expect("advance");
            }
            assert!(sm.is_running());
            assert_eq!(sm.stop(), Ok(SyncStatus::Stopped));
        }
    }
}
