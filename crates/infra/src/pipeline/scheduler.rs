//! Deferred consumption: one detached task per successful dispatch.
//!
//! Task states: `dispatched -> (delay) -> polling -> routed | no_messages`.
//! A message delivered after the last poll of every task is never consumed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use claimflow_core::RequestingUser;
use claimflow_messaging::MessageBus;

use crate::config::ConsumptionSchedule;
use crate::queue_store::{ClaimStore, QueueEntryStore};

use super::PipelineError;
use super::validator::{ClaimValidator, ConsumptionReport};

#[derive(Debug)]
pub enum ConsumptionOutcome {
    Routed(ConsumptionReport),
    NoMessages,
}

/// Handle to a scheduled consumption task.
///
/// Dropping it detaches the task; `join` is for callers (tests) that want the
/// outcome.
#[derive(Debug)]
pub struct ConsumptionHandle {
    task: Option<JoinHandle<Result<ConsumptionOutcome, PipelineError>>>,
}

impl ConsumptionHandle {
    fn unscheduled() -> Self {
        Self { task: None }
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the task. `None` if it was never scheduled or did not finish.
    pub async fn join(self) -> Option<Result<ConsumptionOutcome, PipelineError>> {
        match self.task?.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "consumption task did not complete");
                None
            }
        }
    }
}

pub struct ConsumptionScheduler<S> {
    bus: Arc<dyn MessageBus>,
    validator: Arc<ClaimValidator<S>>,
    schedule: ConsumptionSchedule,
}

impl<S> Clone for ConsumptionScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            validator: Arc::clone(&self.validator),
            schedule: self.schedule,
        }
    }
}

impl<S> ConsumptionScheduler<S>
where
    S: QueueEntryStore + ClaimStore + 'static,
{
    pub fn new(bus: Arc<dyn MessageBus>, validator: Arc<ClaimValidator<S>>, schedule: ConsumptionSchedule) -> Self {
        Self {
            bus,
            validator,
            schedule,
        }
    }

    pub fn validator(&self) -> &ClaimValidator<S> {
        &self.validator
    }

    /// Spawn a detached consumption task on the current runtime.
    ///
    /// Never fails: without a runtime the problem is logged and an
    /// unscheduled handle is returned.
    pub fn schedule(&self, user: &RequestingUser) -> ConsumptionHandle {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(user_id = %user.id, error = %e, "cannot schedule consumption: no async runtime");
                return ConsumptionHandle::unscheduled();
            }
        };

        let scheduler = self.clone();
        let user = user.clone();
        let task = runtime.spawn(async move {
            let outcome = scheduler.run(&user).await;
            match &outcome {
                Ok(ConsumptionOutcome::Routed(report)) => info!(
                    state = "routed",
                    user_id = %user.id,
                    forwarded = report.forwarded.len(),
                    "consumption task finished"
                ),
                Ok(ConsumptionOutcome::NoMessages) => {
                    info!(state = "no_messages", user_id = %user.id, "consumption task finished")
                }
                Err(e) => error!(user_id = %user.id, error = %e, "consumption task failed"),
            }
            outcome
        });

        ConsumptionHandle { task: Some(task) }
    }

    /// Body of a consumption task: wait, then drain up to `max_polls` times,
    /// routing the first non-empty drain to the validator.
    pub async fn run(&self, user: &RequestingUser) -> Result<ConsumptionOutcome, PipelineError> {
        info!(
            state = "dispatched",
            user_id = %user.id,
            delay_ms = self.schedule.delay.as_millis() as u64,
            "consumption scheduled"
        );
        tokio::time::sleep(self.schedule.delay).await;

        let max_polls = self.schedule.max_polls.max(1);
        for poll in 1..=max_polls {
            info!(state = "polling", user_id = %user.id, poll, "draining message bus");
            let messages = self
                .bus
                .drain(self.schedule.drain_batch)
                .await
                .map_err(PipelineError::Drain)?;

            if !messages.is_empty() {
                let report = self.validator.process_consumed(&messages, user).await?;
                return Ok(ConsumptionOutcome::Routed(report));
            }
            if poll < max_polls {
                tokio::time::sleep(self.schedule.poll_interval).await;
            }
        }

        Ok(ConsumptionOutcome::NoMessages)
    }
}
