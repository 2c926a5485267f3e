//! Bridges instance cache lifecycle events to bean callbacks.

use super::instance::Instance;
use super::ContainerCore;
use crate::cache::CacheListener;
use crate::error::BoxError;
use crate::interceptor::Operation;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Cache listener that runs the activate, passivate and pre-destroy callbacks.
///
/// Instances the cache drops on its own are handed to the owning container so
/// their extended contexts are closed and the discard is counted.
#[derive(Debug)]
pub(crate) struct StatefulCacheListener {
    container: Weak<ContainerCore>,
}

impl StatefulCacheListener {
    pub(crate) fn new(container: Weak<ContainerCore>) -> Self {
        Self { container }
    }

    fn retire(&self, instance: &Arc<Instance>, pre_destroy: bool) -> Result<(), BoxError> {
        match self.container.upgrade() {
            Some(container) => container
                .retire_instance(instance, pre_destroy)
                .map_err(BoxError::from),
            None => {
                instance.discard();
                Ok(())
            }
        }
    }
}

impl CacheListener<Arc<Instance>> for StatefulCacheListener {
    fn after_load(&self, instance: &Arc<Instance>) -> Result<(), BoxError> {
        let Err(err) = instance.invoke_callback(Operation::Activate, Vec::new()) else {
            return Ok(());
        };
        warn!(session = %instance.primary_key(), error = %err, "post_activate failed; instance discarded");
        if let Err(cleanup) = self.retire(instance, false) {
            warn!(session = %instance.primary_key(), error = %cleanup, "failed to retire instance");
        }
        Err(err.into())
    }

    fn before_store(&self, instance: &Arc<Instance>) -> Result<(), BoxError> {
        debug!(session = %instance.primary_key(), deployment = instance.deployment_id(), "passivating instance");
        let Err(err) = instance.invoke_callback(Operation::Passivate, Vec::new()) else {
            return Ok(());
        };
        warn!(session = %instance.primary_key(), error = %err, "pre_passivate failed; instance discarded");
        if let Err(cleanup) = self.retire(instance, true) {
            warn!(session = %instance.primary_key(), error = %cleanup, "pre_destroy failed");
        }
        Err(err.into())
    }

    fn timed_out(&self, instance: &Arc<Instance>) -> Result<(), BoxError> {
        info!(session = %instance.primary_key(), deployment = instance.deployment_id(), "removing timed-out stateful session instance");
        self.retire(instance, true)
    }
}
