//! Session synchronization across a transaction.
//!
//! One coordinator is registered per transaction (or per local scope) the first
//! time a stateful instance joins it. It remembers every instance that took
//! part, drives their session synchronization callbacks and, when the
//! transaction completes, hands each instance back to the container that owns
//! it.

use super::instance::Instance;
use super::ContainerCore;
use crate::bean::BeanError;
use crate::error::BoxError;
use crate::interceptor::Operation;
use crate::transaction::{Status, Transaction, TransactionSynchronization};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// One instance's participation in a transaction.
struct Participant {
    container: Arc<ContainerCore>,
    instance: Arc<Instance>,
    call_session_synchronization: AtomicBool,
}

/// Drives session synchronization for every instance enlisted in one transaction.
#[derive(Default)]
pub(crate) struct SessionSynchronizationCoordinator {
    participants: Mutex<Vec<Arc<Participant>>>,
}

impl SessionSynchronizationCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enlists `instance`. The first time session synchronization is switched
    /// on for it, `after_begin` runs; registering again never repeats it.
    pub(crate) fn register(
        &self,
        container: &Arc<ContainerCore>,
        instance: &Arc<Instance>,
        synchronize: bool,
    ) -> Result<(), BeanError> {
        let participant = {
            let mut participants = self.participants.lock();
            let existing = participants
                .iter()
                .find(|p| Arc::ptr_eq(&p.instance, instance))
                .cloned();
            existing.unwrap_or_else(|| {
                let participant = Arc::new(Participant {
                    container: Arc::clone(container),
                    instance: Arc::clone(instance),
                    call_session_synchronization: AtomicBool::new(false),
                });
                participants.push(Arc::clone(&participant));
                participant
            })
        };

        if !synchronize
            || participant
                .call_session_synchronization
                .swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        instance
            .invoke_callback(Operation::AfterBegin, Vec::new())
            .map(drop)
            .map_err(|err| {
                error!(session = %instance.primary_key(), error = %err, "after_begin failed");
                err
            })
    }

    fn snapshot(&self) -> Vec<Arc<Participant>> {
        self.participants.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.participants.lock().len()
    }
}

impl TransactionSynchronization for SessionSynchronizationCoordinator {
    fn before_completion(&self, transaction: Option<&Transaction>) -> Result<(), BoxError> {
        for participant in self.snapshot() {
            if transaction.is_some_and(Transaction::is_rollback_only) {
                return Ok(());
            }
            let instance = &participant.instance;
            if instance.is_discarded()
                || !participant.call_session_synchronization.load(Ordering::Acquire)
            {
                continue;
            }
            instance.set_in_use(true);
            let result = instance.invoke_callback(Operation::BeforeCompletion, Vec::new());
            instance.set_in_use(false);
            if let Err(err) = result {
                error!(session = %instance.primary_key(), error = %err, "before_completion failed");
                if let Some(tx) = transaction {
                    tx.set_rollback_only(err.to_string());
                }
                participant.container.discard_instance(instance);
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn after_completion(&self, status: Status) -> Result<(), BoxError> {
        let committed = status == Status::Committed;
        let mut first_failure: Option<BoxError> = None;
        for participant in self.snapshot() {
            let instance = &participant.instance;
            let discarded = instance.state().discarded;
            let callback = if discarded
                || !participant.call_session_synchronization.load(Ordering::Acquire)
            {
                Ok(())
            } else {
                instance.set_in_use(true);
                instance
                    .invoke_callback(Operation::AfterCompletion, vec![Value::Bool(committed)])
                    .map(drop)
            };

            let outcome = callback.map_err(BoxError::from).and_then(|()| {
                participant
                    .container
                    .release_instance(instance)
                    .map_err(BoxError::from)
            });
            if let Err(err) = outcome {
                error!(session = %instance.primary_key(), error = %err, "after_completion failed; discarding instance");
                participant.container.discard_instance(instance);
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SessionSynchronizationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSynchronizationCoordinator")
            .field("participants", &self.participants.lock().len())
            .finish()
    }
}
