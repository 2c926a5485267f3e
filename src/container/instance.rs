//! Live session instances, their identity and their passivated form.

use crate::bean::{BeanContext, BeanError, SessionBean};
use crate::error::PassivationError;
use crate::interceptor::{InterceptorStack, Operation};
use crate::passivation::SnapshotCodec;
use crate::transaction::{TransactionId, UserTransaction};
use crate::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of one session. Random, 128 bits, rendered as 32 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionId(u128);

impl SessionId {
    /// A fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Id from its raw value.
    pub const fn from_u128(raw: u128) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(SessionId)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SessionId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Bean plus the per-session state of its interceptors.
pub(crate) struct Conversation {
    pub(crate) bean: Box<dyn SessionBean>,
    pub(crate) interceptors: BTreeMap<String, Value>,
}

/// Call bookkeeping, guarded by the instance monitor.
#[derive(Debug, Default)]
pub(crate) struct InstanceState {
    /// A call (or completion callback) is running.
    pub(crate) in_use: bool,
    /// Transaction the instance is bound to.
    pub(crate) transaction: Option<TransactionId>,
    /// Suspended bean-managed transaction that outlives the current call.
    pub(crate) bean_transaction: Option<Arc<crate::transaction::Transaction>>,
    /// Discarded after a system exception or removal; gets no more callbacks.
    pub(crate) discarded: bool,
}

/// One live session instance.
pub struct Instance {
    primary_key: SessionId,
    deployment: Arc<BeanContext>,
    conversation: Mutex<Conversation>,
    state: Mutex<InstanceState>,
    released: Condvar,
}

impl Instance {
    pub(crate) fn new(
        primary_key: SessionId,
        deployment: Arc<BeanContext>,
        bean: Box<dyn SessionBean>,
    ) -> Self {
        Self {
            primary_key,
            deployment,
            conversation: Mutex::new(Conversation {
                bean,
                interceptors: BTreeMap::new(),
            }),
            state: Mutex::new(InstanceState::default()),
            released: Condvar::new(),
        }
    }

    /// Session id.
    pub fn primary_key(&self) -> SessionId {
        self.primary_key
    }

    /// Deployment the instance belongs to.
    pub fn deployment(&self) -> &Arc<BeanContext> {
        &self.deployment
    }

    /// Deployment id.
    pub fn deployment_id(&self) -> &str {
        self.deployment.id()
    }

    /// `true` while a call runs on the instance.
    pub fn is_in_use(&self) -> bool {
        self.state.lock().in_use
    }

    /// Transaction the instance is bound to.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.state.lock().transaction
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock()
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.state.lock().in_use = in_use;
    }

    /// Unbinds the instance from its transaction and wakes callers waiting for it.
    pub(crate) fn clear_transaction(&self) {
        self.state.lock().transaction = None;
        self.released.notify_all();
    }

    /// Marks the instance discarded and wakes callers waiting for it. Returns
    /// `false` if it already was.
    pub(crate) fn discard(&self) -> bool {
        let newly = !std::mem::replace(&mut self.state.lock().discarded, true);
        self.released.notify_all();
        newly
    }

    /// `true` once the instance has been discarded.
    pub fn is_discarded(&self) -> bool {
        self.state.lock().discarded
    }

    /// Waits until the instance is not bound to any transaction. Returns `false`
    /// if still bound when `timeout` elapses.
    pub(crate) fn wait_for_release(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.transaction.is_some() && !state.discarded {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return state.transaction.is_none();
            }
        }
        true
    }

    /// Runs a business, create or remove method through the method interceptors.
    pub(crate) fn invoke(
        &self,
        operation: Operation,
        method: &str,
        args: Vec<Value>,
        user_transaction: Option<&UserTransaction>,
    ) -> Result<Value, BeanError> {
        let mut conversation = self.conversation.lock();
        let Conversation { bean, interceptors } = &mut *conversation;
        InterceptorStack::new(
            bean.as_mut(),
            operation,
            Some(method),
            self.deployment.method_interceptors(),
            interceptors,
        )
        .with_user_transaction(user_transaction)
        .invoke(args)
    }

    /// Runs a lifecycle or session synchronization callback through the callback
    /// interceptors.
    pub(crate) fn invoke_callback(
        &self,
        operation: Operation,
        args: Vec<Value>,
    ) -> Result<Value, BeanError> {
        debug_assert!(operation.is_callback());
        let mut conversation = self.conversation.lock();
        let Conversation { bean, interceptors } = &mut *conversation;
        InterceptorStack::new(
            bean.as_mut(),
            operation,
            None,
            self.deployment.callback_interceptors(),
            interceptors,
        )
        .invoke(args)
    }

    /// Captures the instance for passivation.
    pub fn snapshot(&self) -> Result<InstanceSnapshot, BeanError> {
        let conversation = self.conversation.lock();
        Ok(InstanceSnapshot {
            version: SNAPSHOT_VERSION,
            deployment_id: self.deployment.id().to_string(),
            primary_key: self.primary_key,
            bean: conversation.bean.snapshot()?,
            interceptors: conversation.interceptors.clone(),
        })
    }

    fn restore(
        snapshot: InstanceSnapshot,
        deployment: Arc<BeanContext>,
    ) -> Result<Self, BeanError> {
        let bean = deployment.restore_bean(snapshot.bean)?;
        let instance = Instance::new(snapshot.primary_key, deployment, bean);
        instance.conversation.lock().interceptors = snapshot.interceptors;
        Ok(instance)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("primary_key", &self.primary_key)
            .field("deployment", &self.deployment.id())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of a passivated instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Format version.
    pub version: u32,
    /// Deployment to restore into.
    pub deployment_id: String,
    /// Session id.
    pub primary_key: SessionId,
    /// Bean state from [`SessionBean::snapshot`].
    pub bean: Value,
    /// Per-session interceptor state.
    pub interceptors: BTreeMap<String, Value>,
}

/// Deployed bean types, shared by the container and its codec.
pub(crate) type Deployments = RwLock<HashMap<String, Arc<BeanContext>>>;

/// Snapshot codec for live instances. Decoding looks the deployment up by id, so
/// snapshots of undeployed beans cannot be restored.
pub struct InstanceCodec {
    deployments: Arc<Deployments>,
}

impl InstanceCodec {
    pub(crate) fn new(deployments: Arc<Deployments>) -> Self {
        Self { deployments }
    }
}

impl fmt::Debug for InstanceCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCodec")
            .field("deployments", &self.deployments.read().len())
            .finish()
    }
}

impl SnapshotCodec<Arc<Instance>> for InstanceCodec {
    fn encode(&self, value: &Arc<Instance>) -> Result<Vec<u8>, PassivationError> {
        let snapshot = value.snapshot().map_err(PassivationError::Bean)?;
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<Instance>, PassivationError> {
        let snapshot: InstanceSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PassivationError::UnsupportedVersion(snapshot.version));
        }
        let deployment = self
            .deployments
            .read()
            .get(&snapshot.deployment_id)
            .cloned()
            .ok_or_else(|| PassivationError::UnknownDeployment(snapshot.deployment_id.clone()))?;
        let instance = Instance::restore(snapshot, deployment).map_err(PassivationError::Bean)?;
        Ok(Arc::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tally(i64);

    impl SessionBean for Tally {
        fn invoke(&mut self, _: &str, _: &[Value]) -> Result<Value, BeanError> {
            self.0 += 1;
            Ok(json!(self.0))
        }

        fn snapshot(&self) -> Result<Value, BeanError> {
            Ok(json!(self.0))
        }
    }

    fn tally_context() -> Arc<BeanContext> {
        Arc::new(BeanContext::new(
            "tally",
            || Ok(Box::new(Tally(0)) as Box<dyn SessionBean>),
            |state| {
                let count = state.as_i64().ok_or_else(|| BeanError::system("bad state"))?;
                Ok(Box::new(Tally(count)) as Box<dyn SessionBean>)
            },
        ))
    }

    #[test]
    fn test_session_id_text_form() {
        let id = SessionId::from_u128(0xabc);
        assert_eq!(id.to_string(), "00000000000000000000000000000abc");
        assert_eq!("abc".parse::<SessionId>().unwrap(), id);
        assert_eq!(serde_json::to_value(id).unwrap(), json!(id.to_string()));
        assert_ne!(SessionId::random(), SessionId::random());
    }

    #[test]
    fn test_codec_round_trip_restores_bean_state() {
        let context = tally_context();
        let deployments: Arc<Deployments> = Arc::new(RwLock::new(HashMap::new()));
        deployments
            .write()
            .insert("tally".to_string(), Arc::clone(&context));
        let codec = InstanceCodec::new(Arc::clone(&deployments));

        let instance = Arc::new(Instance::new(
            SessionId::from_u128(7),
            context,
            Box::new(Tally(0)),
        ));
        instance
            .invoke(Operation::Business, "inc", Vec::new(), None)
            .unwrap();
        let bytes = codec.encode(&instance).unwrap();
        let restored = codec.decode(&bytes).unwrap();
        assert_eq!(restored.primary_key(), SessionId::from_u128(7));
        assert_eq!(
            restored
                .invoke(Operation::Business, "inc", Vec::new(), None)
                .unwrap(),
            json!(2)
        );

        deployments.write().clear();
        assert!(matches!(
            codec.decode(&bytes),
            Err(PassivationError::UnknownDeployment(_))
        ));
    }

    #[test]
    fn test_wait_for_release() {
        let instance = Arc::new(Instance::new(
            SessionId::random(),
            tally_context(),
            Box::new(Tally(0)),
        ));
        assert!(instance.wait_for_release(Duration::ZERO));

        instance.state().transaction = Some(crate::TransactionManager::new().begin().id());
        assert!(!instance.wait_for_release(Duration::from_millis(10)));

        let waiter = Arc::clone(&instance);
        let handle = std::thread::spawn(move || waiter.wait_for_release(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        instance.clear_transaction();
        assert!(handle.join().unwrap());
    }
}
