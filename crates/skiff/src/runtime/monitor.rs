//! Exit monitoring.
//!
//! One watcher task per launched process. The watcher waits on the
//! process's [`ExitWaiter`] and reports the termination exactly once to an
//! [`ExitSink`], tagged with the generation it was started for so the sink
//! can discard reports about superseded process instances.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_common::ContainerId;
use tokio::task::JoinHandle;

use crate::exec::{ExitStatus, ExitWaiter};

/// A process termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Container the process belonged to.
    pub container_id: ContainerId,
    /// Generation the process was launched as.
    pub generation: u64,
    /// Host pid.
    pub pid: u32,
    /// How the process ended.
    pub status: ExitStatus,
}

/// Receives termination reports.
#[async_trait]
pub trait ExitSink: Send + Sync {
    /// Handle a termination. Called once per launched process.
    async fn process_terminated(&self, report: ExitReport);
}

/// Watch one process and report its termination to `sink`.
pub fn spawn(
    sink: Arc<dyn ExitSink>,
    container_id: ContainerId,
    generation: u64,
    pid: u32,
    waiter: ExitWaiter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = waiter.await.unwrap_or_else(|_| {
            ExitStatus::Lost("exit watcher closed without a status".to_string())
        });

        tracing::debug!(
            container_id = %container_id,
            pid,
            generation,
            exit_code = status.exit_code(),
            "Process terminated"
        );

        sink.process_terminated(ExitReport {
            container_id,
            generation,
            pid,
            status,
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ExitReport>>);

    #[async_trait]
    impl ExitSink for Collect {
        async fn process_terminated(&self, report: ExitReport) {
            self.0.lock().push(report);
        }
    }

    #[tokio::test]
    async fn reports_exit_status() {
        let sink = Arc::new(Collect::default());
        let (tx, rx) = oneshot::channel();
        let id = ContainerId::generate();

        let handle = spawn(sink.clone(), id.clone(), 3, 99, rx);
        tx.send(ExitStatus::Exited(101)).unwrap();
        handle.await.unwrap();

        let reports = sink.0.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].container_id, id);
        assert_eq!(reports[0].generation, 3);
        assert_eq!(reports[0].status, ExitStatus::Exited(101));
    }

    #[tokio::test]
    async fn dropped_waiter_is_lost() {
        let sink = Arc::new(Collect::default());
        let (tx, rx) = oneshot::channel::<ExitStatus>();
        drop(tx);

        spawn(sink.clone(), ContainerId::generate(), 1, 5, rx)
            .await
            .unwrap();

        let reports = sink.0.lock();
        assert!(!reports[0].status.was_reaped());
        assert_eq!(reports[0].status.exit_code(), ExitStatus::LOST_EXIT_CODE);
    }
}
