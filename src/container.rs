//! Stateful Session Container
//!
//! Owns the deployments, the instance cache and the checked-out registry, and
//! dispatches create, business and remove calls against them.
//!
//! An instance lives in exactly one of two places between calls:
//!
//! ```text
//!                     create
//!                       │
//!                       ▼
//!   ┌──────────────────────────────┐   tx completes, no tx bound   ┌──────────────────┐
//!   │      CheckedOutRegistry      │ ─────────────────────────────▶ │  InstanceCache   │
//!   │ (in a call or bound to a tx) │ ◀───────────────────────────── │ (idle, may be    │
//!   └──────────────────────────────┘        obtain (check_out)      │  passivated)     │
//!                       │                                          └──────────────────┘
//!                       ▼
//!                remove / system exception / undeploy ──▶ discarded
//! ```
//!
//! Instances of non-passivable deployments never enter the cache and stay in the
//! registry until they are removed.

pub mod instance;
pub mod registry;

mod dispatch;
pub(crate) mod listener;
pub(crate) mod synchronization;

pub use instance::{Instance, InstanceCodec, InstanceSnapshot, SessionId, SNAPSHOT_VERSION};
pub use registry::CheckedOutRegistry;

use crate::bean::{BeanContext, MethodType};
use crate::cache::InstanceCache;
use crate::config::{ContainerConfig, PassivationTarget};
use crate::error::{CacheError, ContainerError, PassivationError};
use crate::metrics::container::ContainerMetrics;
use crate::metrics::Manageable;
use crate::passivation::{DirectoryPassivater, MemoryPassivater, PassivationStrategy};
use crate::services::ContainerServices;
use crate::transaction::{Transaction, TransactionManager};
use instance::Deployments;
use listener::StatefulCacheListener;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::Arc;
use tracing::info;

/// One inbound call.
#[derive(Debug, Clone)]
pub struct Call {
    /// Target deployment.
    pub deployment_id: String,
    /// Method name, looked up in the deployment's method table.
    pub method: String,
    /// Arguments.
    pub args: Vec<Value>,
    /// Target session; required for business and remove calls.
    pub primary_key: Option<SessionId>,
    /// The caller's transaction, if any.
    pub transaction: Option<Arc<Transaction>>,
}

impl Call {
    /// Call of `method` on `deployment_id` with no arguments.
    pub fn new(deployment_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            method: method.into(),
            args: Vec::new(),
            primary_key: None,
            transaction: None,
        }
    }

    /// Sets the arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Targets an existing session.
    pub fn on(mut self, primary_key: SessionId) -> Self {
        self.primary_key = Some(primary_key);
        self
    }

    /// Runs the call inside the caller's transaction.
    pub fn in_transaction(mut self, transaction: &Arc<Transaction>) -> Self {
        self.transaction = Some(Arc::clone(transaction));
        self
    }
}

/// Handle to a created session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Deployment the session belongs to.
    pub deployment_id: String,
    /// Session id.
    pub primary_key: SessionId,
}

/// Result of [`StatefulContainer::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A create method ran.
    Created(SessionHandle),
    /// A business or remove method returned.
    Value(Value),
}

impl Reply {
    /// The returned value; `Null` for a creation.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Created(_) => Value::Null,
            Reply::Value(value) => value,
        }
    }

    /// The created session, if this was a creation.
    pub fn handle(&self) -> Option<&SessionHandle> {
        match self {
            Reply::Created(handle) => Some(handle),
            Reply::Value(_) => None,
        }
    }
}

/// State shared between the container handle, transaction coordinators and
/// cache callbacks.
pub(crate) struct ContainerCore {
    id: String,
    config: ContainerConfig,
    deployments: Arc<Deployments>,
    cache: InstanceCache<SessionId, Arc<Instance>>,
    checked_out: CheckedOutRegistry,
    /// Serializes registry/cache hand-offs. Never held while bean code runs.
    obtain_lock: Mutex<()>,
    services: ContainerServices,
    metrics: ContainerMetrics,
}

impl ContainerCore {
    fn deployment(&self, deployment_id: &str) -> Result<Arc<BeanContext>, ContainerError> {
        self.deployments
            .read()
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| ContainerError::DeploymentNotFound {
                deployment: deployment_id.to_string(),
                container: self.id.clone(),
            })
    }
}

/// A container for stateful session beans.
///
/// Cloning is cheap; clones share the same deployments and instances.
#[derive(Clone)]
pub struct StatefulContainer {
    core: Arc<ContainerCore>,
}

impl StatefulContainer {
    /// Creates a container with default services around `transactions`.
    pub fn new(
        id: impl Into<String>,
        config: ContainerConfig,
        transactions: Arc<TransactionManager>,
    ) -> Result<Self, ContainerError> {
        Self::with_services(id, config, ContainerServices::new(transactions))
    }

    /// Creates a container with explicit services.
    ///
    /// A directory passivation target is created eagerly so a bad path fails
    /// here rather than on the first passivation.
    pub fn with_services(
        id: impl Into<String>,
        config: ContainerConfig,
        services: ContainerServices,
    ) -> Result<Self, ContainerError> {
        let id = id.into();
        let deployments: Arc<Deployments> = Arc::new(RwLock::new(Default::default()));
        let codec = InstanceCodec::new(Arc::clone(&deployments));
        let passivator: Box<dyn PassivationStrategy<SessionId, Arc<Instance>>> =
            match &config.passivation {
                PassivationTarget::Memory => Box::new(MemoryPassivater::new(codec)),
                PassivationTarget::Directory(path) => {
                    fs::create_dir_all(path)
                        .map_err(|err| CacheError::from(PassivationError::from(err)))?;
                    Box::new(DirectoryPassivater::new(path.clone(), codec))
                }
            };
        let cache = InstanceCache::init_boxed(config.cache, passivator);

        info!(container = %id, config = ?config, "stateful container started");
        let core = Arc::new_cyclic(|core| {
            cache.set_listener(Arc::new(StatefulCacheListener::new(core.clone())));
            ContainerCore {
                id,
                config,
                deployments,
                cache,
                checked_out: CheckedOutRegistry::default(),
                obtain_lock: Mutex::new(()),
                services,
                metrics: ContainerMetrics::new(),
            }
        });
        Ok(Self { core })
    }

    /// Container id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Container configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.core.config
    }

    /// Deploys a bean type, replacing any deployment with the same id.
    pub fn deploy(&self, context: BeanContext) -> Arc<BeanContext> {
        let context = Arc::new(context);
        info!(container = %self.core.id, deployment = context.id(), "deployed");
        self.core
            .deployments
            .write()
            .insert(context.id().to_string(), Arc::clone(&context));
        context
    }

    /// Undeploys a bean type and drops every live instance of it.
    ///
    /// Passivated snapshots are left in the store; with the deployment gone they
    /// can no longer be restored.
    pub fn undeploy(&self, deployment_id: &str) -> Option<Arc<BeanContext>> {
        let context = self.core.deployments.write().remove(deployment_id)?;
        context.destroy();

        let belongs = |instance: &Instance| Arc::ptr_eq(instance.deployment(), &context);
        let mut dropped = self.core.cache.remove_all(|instance| belongs(instance));
        dropped.extend(self.core.checked_out.remove_all(belongs));
        for instance in &dropped {
            instance.discard();
            self.core
                .services
                .contexts
                .close(deployment_id, instance.primary_key());
        }
        info!(
            container = %self.core.id,
            deployment = deployment_id,
            instances = dropped.len(),
            "undeployed"
        );
        Some(context)
    }

    /// Looks up a deployment.
    pub fn deployment(&self, deployment_id: &str) -> Option<Arc<BeanContext>> {
        self.core.deployments.read().get(deployment_id).cloned()
    }

    /// Ids of every deployment, sorted.
    pub fn deployment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.core.deployments.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Routes a call by the method's type.
    pub fn invoke(&self, call: Call) -> Result<Reply, ContainerError> {
        let deployment = self.core.deployment(&call.deployment_id)?;
        match deployment.method_type(&call.method) {
            MethodType::Create => self
                .core
                .create(&deployment, call)
                .map(Reply::Created),
            MethodType::Remove => self.core.remove(&deployment, call).map(Reply::Value),
            MethodType::Business => self.core.business(&deployment, call).map(Reply::Value),
        }
    }

    /// Creates a session.
    pub fn create(&self, call: Call) -> Result<SessionHandle, ContainerError> {
        let deployment = self.core.deployment(&call.deployment_id)?;
        self.core.create(&deployment, call)
    }

    /// Runs a business method on an existing session.
    pub fn business(&self, call: Call) -> Result<Value, ContainerError> {
        let deployment = self.core.deployment(&call.deployment_id)?;
        self.core.business(&deployment, call)
    }

    /// Runs a remove method and ends the session.
    pub fn remove(&self, call: Call) -> Result<Value, ContainerError> {
        let deployment = self.core.deployment(&call.deployment_id)?;
        self.core.remove(&deployment, call)
    }

    /// The instance cache.
    pub fn cache(&self) -> &InstanceCache<SessionId, Arc<Instance>> {
        &self.core.cache
    }

    /// Number of instances held outside the cache.
    pub fn checked_out_count(&self) -> usize {
        self.core.checked_out.len()
    }

    /// `true` if `primary_key` is held outside the cache.
    pub fn is_checked_out(&self, primary_key: &SessionId) -> bool {
        self.core.checked_out.contains(primary_key)
    }

    /// Call and outcome counters.
    pub fn container_metrics(&self) -> &ContainerMetrics {
        &self.core.metrics
    }

    /// The transaction manager calls run under.
    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.core.services.transactions
    }
}

impl Manageable for StatefulContainer {
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.core.metrics.to_btreemap();
        metrics.insert("checked_out".to_string(), self.checked_out_count() as f64);
        metrics.insert(
            "deployments".to_string(),
            self.core.deployments.read().len() as f64,
        );
        for (name, value) in self.core.cache.metrics() {
            metrics.insert(format!("cache.{name}"), value);
        }
        metrics
    }

    fn component_name(&self) -> &'static str {
        "StatefulContainer"
    }
}

impl fmt::Debug for StatefulContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulContainer")
            .field("id", &self.core.id)
            .field("deployments", &self.deployment_ids())
            .field("checked_out", &self.core.checked_out.len())
            .field("cache", &self.core.cache)
            .finish()
    }
}
