//! Call dispatch.
//!
//! Every call follows the same shape: authorize, create the transaction policy,
//! obtain (or create) the instance, register it with the transaction's
//! synchronization coordinator, run the interceptor stack, classify any failure
//! and finally complete the policy. Completing the policy is what hands the
//! instance back: the coordinator releases it into the cache once no
//! transaction holds it.

use super::instance::{Instance, SessionId};
use super::synchronization::SessionSynchronizationCoordinator;
use super::{Call, ContainerCore, SessionHandle};
use crate::bean::{BeanContext, BeanError, ExceptionType};
use crate::error::{BoxError, CacheError, ContainerError, TransactionError};
use crate::interceptor::Operation;
use crate::transaction::{Transaction, TransactionPolicy};
use parking_lot::MutexGuard;
use serde_json::Value;
use std::any::TypeId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// A failure raised while a call runs, before it is classified.
enum Thrown {
    Bean(BeanError),
    System {
        message: String,
        source: Option<BoxError>,
    },
    Container(ContainerError),
}

impl From<BeanError> for Thrown {
    fn from(err: BeanError) -> Self {
        Thrown::Bean(err)
    }
}

impl From<ContainerError> for Thrown {
    fn from(err: ContainerError) -> Self {
        Thrown::Container(err)
    }
}

impl From<CacheError> for Thrown {
    fn from(err: CacheError) -> Self {
        Thrown::System {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl ContainerCore {
    pub(crate) fn create(
        self: &Arc<Self>,
        deployment: &Arc<BeanContext>,
        call: Call,
    ) -> Result<SessionHandle, ContainerError> {
        let Call {
            method,
            args,
            transaction,
            ..
        } = call;
        self.authorize(deployment, &method)?;
        let policy = self.policy(deployment, &method, transaction.as_ref())?;
        self.metrics.record_create();

        let primary_key = SessionId::random();
        let mut slot = None;
        let result = self
            .run_create(deployment, policy.as_ref(), primary_key, &method, args, &mut slot)
            .map_err(|thrown| {
                self.handle_exception(deployment, policy.as_ref(), slot.as_ref(), thrown)
            });
        let completed = self.after_invoke(deployment, policy.as_ref(), slot.as_ref());
        result?;
        completed?;
        debug!(deployment = deployment.id(), session = %primary_key, "session created");
        Ok(SessionHandle {
            deployment_id: deployment.id().to_string(),
            primary_key,
        })
    }

    fn run_create(
        self: &Arc<Self>,
        deployment: &Arc<BeanContext>,
        policy: &dyn TransactionPolicy,
        primary_key: SessionId,
        method: &str,
        args: Vec<Value>,
        slot: &mut Option<Arc<Instance>>,
    ) -> Result<(), Thrown> {
        let bean = deployment.new_bean().map_err(|err| Thrown::System {
            message: format!("failed to construct a {} instance: {err}", deployment.id()),
            source: Some(Box::new(err)),
        })?;
        let instance = Arc::new(Instance::new(primary_key, Arc::clone(deployment), bean));
        *slot = Some(Arc::clone(&instance));

        instance.invoke_callback(Operation::PostConstruct, Vec::new())?;
        {
            let mut state = instance.state();
            state.in_use = true;
            state.transaction = policy.current_transaction().map(|tx| tx.id());
        }
        if deployment.is_passivable() {
            self.cache.add(primary_key, Arc::clone(&instance))?;
        }
        self.checked_out.insert(primary_key, Arc::clone(&instance));

        self.services.contexts.enter(deployment.id(), primary_key);
        self.register_session_synchronization(&instance, policy, Operation::Create)?;
        if deployment.is_init_method(method) {
            instance.invoke(Operation::Create, method, args, policy.user_transaction())?;
        }
        Ok(())
    }

    pub(crate) fn business(
        self: &Arc<Self>,
        deployment: &Arc<BeanContext>,
        call: Call,
    ) -> Result<Value, ContainerError> {
        let Call {
            method,
            args,
            primary_key,
            transaction,
            ..
        } = call;
        let primary_key = primary_key.ok_or(ContainerError::NullPrimaryKey)?;
        self.authorize(deployment, &method)?;
        let policy = self.policy(deployment, &method, transaction.as_ref())?;
        self.metrics.record_business();

        let mut slot = None;
        let result = self
            .run_invoke(
                deployment,
                policy.as_ref(),
                primary_key,
                Operation::Business,
                &method,
                args,
                &mut slot,
            )
            .map_err(|thrown| {
                self.handle_exception(deployment, policy.as_ref(), slot.as_ref(), thrown)
            });
        let completed = self.after_invoke(deployment, policy.as_ref(), slot.as_ref());
        let value = result?;
        completed?;
        Ok(value)
    }

    pub(crate) fn remove(
        self: &Arc<Self>,
        deployment: &Arc<BeanContext>,
        call: Call,
    ) -> Result<Value, ContainerError> {
        let Call {
            method,
            args,
            primary_key,
            transaction,
            ..
        } = call;
        let primary_key = primary_key.ok_or(ContainerError::NullPrimaryKey)?;
        self.authorize(deployment, &method)?;
        let policy = self.policy(deployment, &method, transaction.as_ref())?;
        self.metrics.record_remove();

        let mut slot = None;
        let result = self.run_invoke(
            deployment,
            policy.as_ref(),
            primary_key,
            Operation::Remove,
            &method,
            args,
            &mut slot,
        );
        let retain = result.is_err() && deployment.retain_if_exception(&method);
        let result = result.map_err(|thrown| {
            self.handle_exception(deployment, policy.as_ref(), slot.as_ref(), thrown)
        });

        // a failed obtain leaves nothing of ours to destroy
        if let Some(instance) = slot.as_ref().filter(|_| !retain) {
            if !instance.is_discarded() {
                if let Err(err) = instance.invoke_callback(Operation::PreDestroy, Vec::new()) {
                    warn!(session = %primary_key, error = %err, "pre_destroy failed");
                }
                self.discard_instance(instance);
            }
            self.services.contexts.close(deployment.id(), primary_key);
        }

        let completed = self.after_invoke(deployment, policy.as_ref(), slot.as_ref());
        let value = result?;
        completed?;
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_invoke(
        self: &Arc<Self>,
        deployment: &BeanContext,
        policy: &dyn TransactionPolicy,
        primary_key: SessionId,
        operation: Operation,
        method: &str,
        args: Vec<Value>,
        slot: &mut Option<Arc<Instance>>,
    ) -> Result<Value, Thrown> {
        let instance = self.obtain_instance(deployment, primary_key, policy, operation)?;
        *slot = Some(Arc::clone(&instance));

        self.resume_bean_transaction(&instance, policy);
        self.services.contexts.enter(deployment.id(), primary_key);
        self.register_session_synchronization(&instance, policy, operation)?;
        Ok(instance.invoke(operation, method, args, policy.user_transaction())?)
    }

    fn authorize(&self, deployment: &BeanContext, method: &str) -> Result<(), ContainerError> {
        if self
            .services
            .security
            .is_caller_authorized(deployment.id(), method)
        {
            return Ok(());
        }
        warn!(deployment = deployment.id(), method, "call not authorized");
        Err(ContainerError::Unauthorized {
            method: method.to_string(),
        })
    }

    fn policy(
        &self,
        deployment: &BeanContext,
        method: &str,
        client: Option<&Arc<Transaction>>,
    ) -> Result<Box<dyn TransactionPolicy>, ContainerError> {
        let attribute = deployment.transaction_attribute(method);
        Ok(self.services.transactions.create_policy(attribute, client)?)
    }

    /// Finds the instance for `primary_key` and marks it in use.
    ///
    /// The registry is consulted before the cache. An instance bound to another
    /// transaction is waited for up to the access timeout.
    fn obtain_instance(
        &self,
        deployment: &BeanContext,
        primary_key: SessionId,
        policy: &dyn TransactionPolicy,
        operation: Operation,
    ) -> Result<Arc<Instance>, Thrown> {
        let current = policy.current_transaction().map(|tx| tx.id());
        let deadline = self
            .config
            .access_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            let (instance, obtain) = self.find_instance(deployment, primary_key)?;
            let mut state = instance.state();
            if state.in_use && !operation.is_completion_callback() {
                self.metrics.record_concurrent_access();
                return Err(ContainerError::ConcurrentAccess(primary_key).into());
            }
            match state.transaction {
                Some(owner) if Some(owner) != current => {}
                bound => {
                    if bound.is_none() {
                        state.transaction = current;
                    }
                    state.in_use = true;
                    drop(state);
                    return Ok(instance);
                }
            }
            drop(state);
            drop(obtain);

            let waited = deadline.is_some_and(|deadline| {
                let now = Instant::now();
                now < deadline && instance.wait_for_release(deadline - now)
            });
            if !waited {
                self.metrics.record_affinity_rejection();
                debug!(session = %primary_key, "instance is bound to another transaction");
                return Err(ContainerError::TransactionAffinity(primary_key).into());
            }
        }
    }

    /// Looks `primary_key` up in the registry, then in the cache, and returns
    /// the instance with the obtain lock held.
    ///
    /// Only instances resident in memory are taken under the lock. Activation
    /// runs the bean's activate callback, so it happens with the lock released
    /// and the result is moved into the registry afterwards.
    fn find_instance(
        &self,
        deployment: &BeanContext,
        primary_key: SessionId,
    ) -> Result<(Arc<Instance>, MutexGuard<'_, ()>), Thrown> {
        let obtain = self.obtain_lock.lock();
        if let Some(instance) = self.checked_out.get(&primary_key) {
            return self.owned(deployment, instance, obtain);
        }
        match self.cache.try_check_out(&primary_key) {
            Ok(Some(instance)) => return self.adopt(deployment, instance, obtain),
            Ok(None) => {}
            Err(err) => return Err(self.check_out_failed(primary_key, err)),
        }
        drop(obtain);

        match self.cache.check_out(&primary_key) {
            Ok(Some(instance)) => {
                let obtain = self.obtain_lock.lock();
                self.adopt(deployment, instance, obtain)
            }
            Ok(None) => Err(self.invalid_reference(primary_key)),
            Err(CacheError::AlreadyCheckedOut(key)) => {
                // the entry was busy with a hand-off into the registry
                let obtain = self.obtain_lock.lock();
                match self.checked_out.get(&primary_key) {
                    Some(instance) => self.owned(deployment, instance, obtain),
                    None => Err(
                        self.check_out_failed(primary_key, CacheError::AlreadyCheckedOut(key)),
                    ),
                }
            }
            Err(err) => Err(self.check_out_failed(primary_key, err)),
        }
    }

    fn owned<'g>(
        &self,
        deployment: &BeanContext,
        instance: Arc<Instance>,
        obtain: MutexGuard<'g, ()>,
    ) -> Result<(Arc<Instance>, MutexGuard<'g, ()>), Thrown> {
        if instance.deployment_id() != deployment.id() {
            return Err(self.invalid_reference(instance.primary_key()));
        }
        Ok((instance, obtain))
    }

    /// Moves an instance just checked out of the cache into the registry.
    fn adopt<'g>(
        &self,
        deployment: &BeanContext,
        instance: Arc<Instance>,
        obtain: MutexGuard<'g, ()>,
    ) -> Result<(Arc<Instance>, MutexGuard<'g, ()>), Thrown> {
        let primary_key = instance.primary_key();
        if instance.deployment_id() != deployment.id() {
            self.cache.release(&primary_key)?;
            return Err(self.invalid_reference(primary_key));
        }
        self.checked_out.insert(primary_key, Arc::clone(&instance));
        Ok((instance, obtain))
    }

    fn check_out_failed(&self, primary_key: SessionId, err: CacheError) -> Thrown {
        match err {
            CacheError::AlreadyCheckedOut(_) => {
                self.metrics.record_concurrent_access();
                ContainerError::ConcurrentAccess(primary_key).into()
            }
            other => other.into(),
        }
    }

    fn invalid_reference(&self, primary_key: SessionId) -> Thrown {
        self.metrics.record_invalid_reference();
        ContainerError::InvalidReference(primary_key).into()
    }

    /// Returns an instance to the cache once nothing holds it.
    ///
    /// Instances still carrying a suspended bean-managed transaction, instances
    /// of non-passivable deployments and instances of undeployed beans stay out
    /// of the cache. The LRU pass that follows runs without the obtain lock, as
    /// its passivate and timeout callbacks may call back into the container.
    pub(crate) fn release_instance(&self, instance: &Arc<Instance>) -> Result<(), CacheError> {
        let primary_key = instance.primary_key();
        let released = {
            let _obtain = self.obtain_lock.lock();
            instance.clear_transaction();
            {
                let mut state = instance.state();
                if state.discarded || instance.deployment().is_destroyed() {
                    return Ok(());
                }
                state.in_use = false;
                if state.bean_transaction.is_some() {
                    debug!(session = %primary_key, "instance holds a bean-managed transaction; not returned to the cache");
                    return Ok(());
                }
                if !instance.deployment().is_passivable() {
                    return Ok(());
                }
            }
            self.checked_out.remove(&primary_key);
            self.cache.release(&primary_key)?
        };
        if released {
            self.cache.process_lru();
        }
        Ok(())
    }

    /// Drops an instance from the registry and the cache. No callbacks run.
    pub(crate) fn discard_instance(&self, instance: &Arc<Instance>) {
        if !instance.discard() {
            return;
        }
        let primary_key = instance.primary_key();
        instance.clear_transaction();
        {
            let _obtain = self.obtain_lock.lock();
            self.checked_out.remove(&primary_key);
            if instance.deployment().is_passivable() {
                self.cache.remove(&primary_key);
            }
        }
        self.metrics.record_discard();
        debug!(session = %primary_key, deployment = instance.deployment_id(), "instance discarded");
    }

    /// Ends an instance the cache let go of on its own: timed out, or refused
    /// by its passivate or activate callback. The cache entry is already gone.
    pub(crate) fn retire_instance(
        &self,
        instance: &Arc<Instance>,
        pre_destroy: bool,
    ) -> Result<(), BeanError> {
        if !instance.discard() {
            return Ok(());
        }
        let primary_key = instance.primary_key();
        let destroyed = if pre_destroy {
            instance
                .invoke_callback(Operation::PreDestroy, Vec::new())
                .map(drop)
        } else {
            Ok(())
        };
        self.services
            .contexts
            .close(instance.deployment_id(), primary_key);
        self.metrics.record_discard();
        debug!(session = %primary_key, deployment = instance.deployment_id(), "instance retired by the cache");
        destroyed
    }

    fn handle_exception(
        &self,
        deployment: &BeanContext,
        policy: &dyn TransactionPolicy,
        instance: Option<&Arc<Instance>>,
        thrown: Thrown,
    ) -> ContainerError {
        match thrown {
            Thrown::Container(err) => err,
            Thrown::Bean(err) => match deployment.exception_type(&err) {
                ExceptionType::Application => {
                    self.metrics.record_application_exception();
                    ContainerError::Application(err)
                }
                ExceptionType::ApplicationRollback => {
                    self.metrics.record_application_exception();
                    policy.set_rollback_only(&err.to_string());
                    ContainerError::Application(err)
                }
                ExceptionType::System => {
                    let message = err.to_string();
                    self.system_exception(policy, instance, message, Some(Box::new(err)))
                }
            },
            Thrown::System { message, source } => {
                self.system_exception(policy, instance, message, source)
            }
        }
    }

    fn system_exception(
        &self,
        policy: &dyn TransactionPolicy,
        instance: Option<&Arc<Instance>>,
        message: String,
        source: Option<BoxError>,
    ) -> ContainerError {
        self.metrics.record_system_exception();
        error!(
            container = %self.id,
            session = ?instance.map(|i| i.primary_key()),
            error = %message,
            "system exception"
        );
        if let Some(instance) = instance {
            self.discard_instance(instance);
        }
        policy.set_rollback_only(&message);
        if policy.is_client_transaction() {
            ContainerError::TransactionRolledBack(message)
        } else {
            ContainerError::System { message, source }
        }
    }

    fn register_session_synchronization(
        self: &Arc<Self>,
        instance: &Arc<Instance>,
        policy: &dyn TransactionPolicy,
        operation: Operation,
    ) -> Result<(), BeanError> {
        let key = TypeId::of::<SessionSynchronizationCoordinator>();
        let registered = policy
            .resource(key)
            .and_then(|resource| resource.downcast::<SessionSynchronizationCoordinator>().ok());
        let coordinator = match registered {
            Some(coordinator) => coordinator,
            None => {
                let coordinator = Arc::new(SessionSynchronizationCoordinator::new());
                policy.put_resource(key, coordinator.clone());
                policy.register_synchronization(coordinator.clone());
                coordinator
            }
        };

        let synchronize = operation != Operation::Create
            && instance.deployment().is_session_synchronized()
            && policy.is_transaction_active();
        coordinator.register(self, instance, synchronize)
    }

    fn resume_bean_transaction(&self, instance: &Instance, policy: &dyn TransactionPolicy) {
        let Some(user) = policy.user_transaction() else {
            return;
        };
        let suspended = instance.state().bean_transaction.take();
        if let Some(transaction) = suspended {
            debug!(session = %instance.primary_key(), transaction = %transaction.id(), "resuming bean-managed transaction");
            user.resume(transaction);
        }
    }

    fn after_invoke(
        &self,
        deployment: &BeanContext,
        policy: &dyn TransactionPolicy,
        instance: Option<&Arc<Instance>>,
    ) -> Result<(), ContainerError> {
        if let Some(instance) = instance {
            self.services
                .contexts
                .exit(deployment.id(), instance.primary_key());
            if let Some(user) = policy.user_transaction() {
                let suspended = user.suspend();
                if let Some(transaction) = &suspended {
                    debug!(session = %instance.primary_key(), transaction = %transaction.id(), "suspending bean-managed transaction");
                }
                instance.state().bean_transaction = suspended;
            }
            // the caller's transaction outlives this call; later calls in it may reuse the instance
            if policy.is_client_transaction() {
                instance.set_in_use(false);
            }
        }
        policy.complete().map_err(|err| match err {
            TransactionError::RolledBack { cause, .. } => ContainerError::TransactionRolledBack(cause),
            other => other.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::MethodInfo;
    use crate::config::ContainerConfig;
    use crate::cache::EntryState;
    use crate::transaction::{Status, TransactionManager};
    use crate::{SessionBean, StatefulContainer};
    use serde_json::json;

    /// Counter bean whose `after_completion` fails once the count goes negative.
    struct Flaky {
        count: i64,
    }

    impl SessionBean for Flaky {
        fn invoke(&mut self, method: &str, _: &[Value]) -> Result<Value, BeanError> {
            match method {
                "increment" => {
                    self.count += 1;
                    Ok(json!(self.count))
                }
                "decrement" => {
                    self.count -= 1;
                    Ok(json!(self.count))
                }
                _ => Ok(json!(self.count)),
            }
        }

        fn after_completion(&mut self, _: bool) -> Result<(), BeanError> {
            if self.count < 0 {
                return Err(BeanError::system("after_completion refused"));
            }
            Ok(())
        }

        fn snapshot(&self) -> Result<Value, BeanError> {
            Ok(json!(self.count))
        }
    }

    fn container() -> StatefulContainer {
        let container =
            StatefulContainer::new("test", ContainerConfig::default(), TransactionManager::new())
                .unwrap();
        container.deploy(
            BeanContext::new(
                "flaky",
                || Ok(Box::new(Flaky { count: 0 }) as Box<dyn SessionBean>),
                |state| {
                    let count = state.as_i64().unwrap_or_default();
                    Ok(Box::new(Flaky { count }) as Box<dyn SessionBean>)
                },
            )
            .with_method("create", MethodInfo::create())
            .with_session_synchronization(true),
        );
        container
    }

    fn create(container: &StatefulContainer) -> SessionId {
        container
            .create(Call::new("flaky", "create"))
            .unwrap()
            .primary_key
    }

    #[test]
    fn test_after_completion_failure_does_not_block_other_releases() {
        let container = container();
        let a = create(&container);
        let b = create(&container);

        let tx = container.transaction_manager().begin();
        for (key, method) in [(a, "decrement"), (b, "increment")] {
            container
                .business(Call::new("flaky", method).on(key).in_transaction(&tx))
                .unwrap();
            assert!(container.is_checked_out(&key));
        }
        tx.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);

        assert!(!container.is_checked_out(&b));
        assert_eq!(container.cache().entry_state(&b), Some(EntryState::Available));
        assert_eq!(
            container.business(Call::new("flaky", "get").on(b)).unwrap(),
            json!(1)
        );

        assert!(!container.is_checked_out(&a));
        let err = container
            .business(Call::new("flaky", "get").on(a))
            .unwrap_err();
        assert!(err.is_invalid_reference());
        assert_eq!(container.container_metrics().discards(), 1);
    }

    #[test]
    fn test_reentrant_completion_callback_is_allowed() {
        let container = container();
        let key = create(&container);
        let core = &container.core;
        let deployment = container.deployment("flaky").unwrap();
        let policy = core.policy(&deployment, "increment", None).unwrap();

        let first = core.obtain_instance(&deployment, key, policy.as_ref(), Operation::Business);
        let instance = match first {
            Ok(instance) => instance,
            Err(_) => panic!("first obtain should succeed"),
        };
        assert!(instance.is_in_use());

        let second = core.obtain_instance(&deployment, key, policy.as_ref(), Operation::Business);
        assert!(matches!(
            second,
            Err(Thrown::Container(ContainerError::ConcurrentAccess(k))) if k == key
        ));

        let reentrant =
            core.obtain_instance(&deployment, key, policy.as_ref(), Operation::AfterCompletion);
        assert!(matches!(reentrant, Ok(ref same) if Arc::ptr_eq(same, &instance)));

        core.release_instance(&instance).unwrap();
        assert!(!instance.is_in_use());
        policy.complete().unwrap();
    }

    #[test]
    fn test_coordinator_registers_once_per_transaction() {
        let container = container();
        let key = create(&container);
        let tx = container.transaction_manager().begin();
        for _ in 0..3 {
            container
                .business(Call::new("flaky", "increment").on(key).in_transaction(&tx))
                .unwrap();
        }
        let coordinator = tx
            .resource(TypeId::of::<SessionSynchronizationCoordinator>())
            .and_then(|r| r.downcast::<SessionSynchronizationCoordinator>().ok())
            .unwrap();
        assert_eq!(coordinator.len(), 1);

        tx.commit().unwrap();
        assert_eq!(container.cache().entry_state(&key), Some(EntryState::Available));
    }
}
