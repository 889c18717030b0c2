//! Interval refresh of a request while it waits on someone else
use super::error::Result;
use super::query::Projections;
use super::request::RequestDetail;
use super::status::Status;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Only the two waiting statuses are worth watching.
pub fn should_poll(status: Status) -> bool {
    status.is_waiting()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The request left the waiting statuses.
    Settled(Status),
    Cancelled,
}

/// Shortest refresh period; tokio refuses a zero interval.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone)]
pub struct StatusPoller {
    projections: Projections,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(projections: Projections, interval: Duration) -> Self {
        Self {
            projections,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Start refreshing `request_id`. The first snapshot is taken right away;
    /// a request that is not waiting settles after that one read.
    pub fn watch(&self, request_id: &str) -> PollHandle {
        let (updates_tx, updates) = watch::channel(None);
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(run(
            self.projections.clone(),
            request_id.to_string(),
            self.interval,
            updates_tx,
            cancelled,
        ));

        PollHandle {
            updates,
            cancel,
            task,
        }
    }
}

async fn run(
    projections: Projections,
    request_id: String,
    interval: Duration,
    updates: watch::Sender<Option<RequestDetail>>,
    mut cancelled: oneshot::Receiver<()>,
) -> Result<PollOutcome> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // a dropped handle counts as a cancel
            _ = &mut cancelled => {
                tracing::debug!(request_id = %request_id, "polling cancelled");
                return Ok(PollOutcome::Cancelled);
            }
            _ = ticker.tick() => {
                let detail = projections.request(&request_id)?;
                let status = detail.status();
                updates.send_replace(Some(detail));
                if !should_poll(status) {
                    tracing::debug!(request_id = %request_id, %status, "polling stopped");
                    return Ok(PollOutcome::Settled(status));
                }
            }
        }
    }
}

/// Owner side of a running poll. Dropping it stops the task.
pub struct PollHandle {
    updates: watch::Receiver<Option<RequestDetail>>,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<Result<PollOutcome>>,
}

impl PollHandle {
    /// Subscribe to snapshots; `None` until the first read lands.
    pub fn updates(&self) -> watch::Receiver<Option<RequestDetail>> {
        self.updates.clone()
    }

    pub fn latest(&self) -> Option<RequestDetail> {
        self.updates.borrow().clone()
    }

    /// Stop polling. Nothing is written either way.
    pub async fn cancel(self) -> Result<PollOutcome> {
        let PollHandle { cancel, task, .. } = self;
        // the task may already have settled and dropped its receiver
        let _ = cancel.send(());
        join(task).await
    }

    /// Wait for the request to leave the waiting statuses.
    pub async fn finished(self) -> Result<PollOutcome> {
        let PollHandle {
            cancel: _cancel,
            task,
            ..
        } = self;
        join(task).await
    }
}

async fn join(task: JoinHandle<Result<PollOutcome>>) -> Result<PollOutcome> {
    match task.await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Ok(PollOutcome::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_waiting_statuses_are_polled() {
        let polled: Vec<Status> = Status::ALL.into_iter().filter(|s| should_poll(*s)).collect();
        assert_eq!(
            polled,
            vec![Status::WaitingForLetter, Status::WaitingForBankApproval]
        );
    }
}
