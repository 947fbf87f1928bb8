//! Worker that feeds ledger transitions and executor outcomes to the orchestrator.

use keel_core::executor::OutcomeReceiver;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ledger::TransitionReceiver;
use crate::orchestrator::Orchestrator;

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    transitions: TransitionReceiver,
    outcomes: OutcomeReceiver,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        transitions: TransitionReceiver,
        outcomes: OutcomeReceiver,
    ) -> Self {
        Self {
            orchestrator,
            transitions,
            outcomes,
        }
    }

    /// Run the worker loop until both channels close.
    ///
    /// Each event is handled on its own task, so a slow rebase or merge for
    /// one job never holds up the others.
    pub async fn run(mut self) {
        info!("Starting worker");

        let mut transitions_open = true;
        let mut outcomes_open = true;
        while transitions_open || outcomes_open {
            tokio::select! {
                transition = self.transitions.recv(), if transitions_open => match transition {
                    Some(transition) => {
                        let orchestrator = self.orchestrator.clone();
                        tokio::spawn(async move {
                            orchestrator.on_queue_transition(transition).await;
                        });
                    }
                    None => transitions_open = false,
                },
                outcome = self.outcomes.recv(), if outcomes_open => match outcome {
                    Some(outcome) => {
                        debug!(%outcome, "Executor outcome");
                        let orchestrator = self.orchestrator.clone();
                        tokio::spawn(async move {
                            orchestrator.on_job_outcome(outcome).await;
                        });
                    }
                    None => outcomes_open = false,
                },
            }
        }

        info!("Worker stopped");
    }

    /// Handle every event already queued, and any they cause, one at a time.
    /// Returns the number of events handled.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(transition) = self.transitions.try_recv() {
                self.orchestrator.on_queue_transition(transition).await;
            } else if let Ok(outcome) = self.outcomes.try_recv() {
                self.orchestrator.on_job_outcome(outcome).await;
            } else {
                return handled;
            }
            handled += 1;
        }
    }
}
