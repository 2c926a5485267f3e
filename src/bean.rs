//! Session beans and their deployment metadata.
//!
//! A [`SessionBean`] is the user-supplied component; a [`BeanContext`] describes
//! one deployed bean type: how to construct and restore it, how each method is
//! dispatched, which errors are application exceptions and which interceptors
//! wrap its calls.

use crate::interceptor::{InterceptorBinding, InvocationContext};
use crate::transaction::TransactionAttribute;
use crate::HashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error raised by bean code.
///
/// Whether an [`Application`](BeanError::Application) error is treated as an
/// application exception depends on the deployment: only names registered with
/// [`BeanContext::with_application_exception`] are. Everything else is a system
/// exception and discards the instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BeanError {
    /// A named, possibly declared, business error.
    #[error("{name}: {message}")]
    Application {
        /// Exception class name, matched against the deployment's declarations.
        name: String,
        /// Human-readable message.
        message: String,
    },
    /// An unexpected failure.
    #[error("{0}")]
    System(String),
}

impl BeanError {
    /// Named business error.
    pub fn application(name: impl Into<String>, message: impl Into<String>) -> Self {
        BeanError::Application {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Unexpected failure.
    pub fn system(message: impl Into<String>) -> Self {
        BeanError::System(message.into())
    }
}

/// The component contract. Lifecycle hooks default to no-ops.
pub trait SessionBean: Send {
    /// Runs a business or remove method.
    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, BeanError>;

    /// Runs a create method that initializes the bean from arguments.
    fn create(&mut self, _method: &str, _args: &[Value]) -> Result<(), BeanError> {
        Ok(())
    }

    /// Called once after construction.
    fn post_construct(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Called before the instance is discarded by remove or timeout.
    fn pre_destroy(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Called after the instance was restored from the passivation store.
    fn post_activate(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Called before the instance is passivated. An error vetoes passivation and
    /// the instance is discarded.
    fn pre_passivate(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Session synchronization: the instance joined a transaction.
    fn after_begin(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Session synchronization: the transaction is about to complete.
    fn before_completion(&mut self) -> Result<(), BeanError> {
        Ok(())
    }

    /// Session synchronization: the transaction completed.
    fn after_completion(&mut self, _committed: bool) -> Result<(), BeanError> {
        Ok(())
    }

    /// Conversational state written when the instance is passivated.
    fn snapshot(&self) -> Result<Value, BeanError>;
}

/// How a method is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// Creates a new session.
    Create,
    /// Ends the session.
    Remove,
    /// Runs on an existing session.
    Business,
}

/// Dispatch metadata for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Dispatch kind.
    pub method_type: MethodType,
    /// Overrides the deployment's default attribute.
    pub transaction: Option<TransactionAttribute>,
    /// For remove methods: keep the session if the method raises.
    pub retain_if_exception: bool,
    /// For create methods: run [`SessionBean::create`] with the call arguments.
    pub init: bool,
}

impl MethodInfo {
    /// A create method that initializes the bean.
    pub fn create() -> Self {
        Self {
            method_type: MethodType::Create,
            transaction: None,
            retain_if_exception: false,
            init: true,
        }
    }

    /// A remove method.
    pub fn remove() -> Self {
        Self {
            method_type: MethodType::Remove,
            transaction: None,
            retain_if_exception: false,
            init: false,
        }
    }

    /// A business method.
    pub fn business() -> Self {
        Self {
            method_type: MethodType::Business,
            transaction: None,
            retain_if_exception: false,
            init: false,
        }
    }

    /// Overrides the transaction attribute.
    pub fn with_transaction(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction = Some(attribute);
        self
    }

    /// For remove methods: keep the session when the method raises.
    pub fn retain_if_exception(mut self) -> Self {
        self.retain_if_exception = true;
        self
    }

    /// For create methods: skip [`SessionBean::create`].
    pub fn without_init(mut self) -> Self {
        self.init = false;
        self
    }
}

/// How the container treats a bean error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Declared application exception; the transaction is left alone.
    Application,
    /// Declared application exception that marks the transaction rollback-only.
    ApplicationRollback,
    /// Anything else; the instance is discarded.
    System,
}

/// Constructs a fresh bean.
pub type BeanFactory = dyn Fn() -> Result<Box<dyn SessionBean>, BeanError> + Send + Sync;

/// Rebuilds a bean from its snapshot.
pub type BeanRestorer = dyn Fn(Value) -> Result<Box<dyn SessionBean>, BeanError> + Send + Sync;

/// Metadata for one deployed bean type.
pub struct BeanContext {
    id: String,
    factory: Arc<BeanFactory>,
    restorer: Arc<BeanRestorer>,
    methods: HashMap<String, MethodInfo>,
    default_transaction: TransactionAttribute,
    application_exceptions: HashMap<String, bool>,
    session_synchronized: bool,
    passivable: bool,
    method_interceptors: Vec<InterceptorBinding>,
    callback_interceptors: Vec<InterceptorBinding>,
    destroyed: AtomicBool,
}

impl BeanContext {
    /// Describes a bean type. Methods not registered with
    /// [`with_method`](Self::with_method) are business methods.
    pub fn new<F, R>(id: impl Into<String>, factory: F, restorer: R) -> Self
    where
        F: Fn() -> Result<Box<dyn SessionBean>, BeanError> + Send + Sync + 'static,
        R: Fn(Value) -> Result<Box<dyn SessionBean>, BeanError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(factory),
            restorer: Arc::new(restorer),
            methods: HashMap::new(),
            default_transaction: TransactionAttribute::Required,
            application_exceptions: HashMap::new(),
            session_synchronized: false,
            passivable: true,
            method_interceptors: Vec::new(),
            callback_interceptors: Vec::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Registers dispatch metadata for a method.
    pub fn with_method(mut self, name: impl Into<String>, info: MethodInfo) -> Self {
        self.methods.insert(name.into(), info);
        self
    }

    /// Sets the default transaction attribute. `BeanManaged` makes every method
    /// bean-managed.
    pub fn with_transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.default_transaction = attribute;
        self
    }

    /// Declares an application exception by name.
    pub fn with_application_exception(mut self, name: impl Into<String>, rollback: bool) -> Self {
        self.application_exceptions.insert(name.into(), rollback);
        self
    }

    /// Enables session synchronization callbacks.
    pub fn with_session_synchronization(mut self, enabled: bool) -> Self {
        self.session_synchronized = enabled;
        self
    }

    /// Controls whether instances go through the cache and may be passivated.
    /// Non-passivable instances stay checked out until removed.
    pub fn with_passivation(mut self, enabled: bool) -> Self {
        self.passivable = enabled;
        self
    }

    /// Adds an interceptor around create, business and remove methods.
    pub fn with_method_interceptor<F>(mut self, name: impl Into<String>, interceptor: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>) -> Result<Value, BeanError> + Send + Sync + 'static,
    {
        self.method_interceptors
            .push(InterceptorBinding::new(name, interceptor));
        self
    }

    /// Adds an interceptor around lifecycle and session synchronization callbacks.
    pub fn with_callback_interceptor<F>(mut self, name: impl Into<String>, interceptor: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>) -> Result<Value, BeanError> + Send + Sync + 'static,
    {
        self.callback_interceptors
            .push(InterceptorBinding::new(name, interceptor));
        self
    }

    /// Deployment id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dispatch kind of `method`.
    pub fn method_type(&self, method: &str) -> MethodType {
        self.methods
            .get(method)
            .map_or(MethodType::Business, |info| info.method_type)
    }

    /// Transaction attribute for `method`.
    pub fn transaction_attribute(&self, method: &str) -> TransactionAttribute {
        if self.is_bean_managed() {
            return TransactionAttribute::BeanManaged;
        }
        self.methods
            .get(method)
            .and_then(|info| info.transaction)
            .unwrap_or(self.default_transaction)
    }

    /// `true` if a remove method keeps the session when it raises.
    pub fn retain_if_exception(&self, method: &str) -> bool {
        self.methods
            .get(method)
            .is_some_and(|info| info.retain_if_exception)
    }

    /// `true` if a create method runs [`SessionBean::create`].
    pub fn is_init_method(&self, method: &str) -> bool {
        self.methods.get(method).is_some_and(|info| info.init)
    }

    /// Classifies a bean error.
    pub fn exception_type(&self, error: &BeanError) -> ExceptionType {
        match error {
            BeanError::Application { name, .. } => match self.application_exceptions.get(name) {
                Some(true) => ExceptionType::ApplicationRollback,
                Some(false) => ExceptionType::Application,
                None => ExceptionType::System,
            },
            BeanError::System(_) => ExceptionType::System,
        }
    }

    /// `true` if session synchronization callbacks are enabled.
    pub fn is_session_synchronized(&self) -> bool {
        self.session_synchronized && !self.is_bean_managed()
    }

    /// `true` if instances go through the cache.
    pub fn is_passivable(&self) -> bool {
        self.passivable
    }

    /// `true` if the bean demarcates its own transactions.
    pub fn is_bean_managed(&self) -> bool {
        self.default_transaction == TransactionAttribute::BeanManaged
    }

    /// Constructs a fresh bean.
    pub fn new_bean(&self) -> Result<Box<dyn SessionBean>, BeanError> {
        (self.factory)()
    }

    /// Rebuilds a bean from its snapshot.
    pub fn restore_bean(&self, state: Value) -> Result<Box<dyn SessionBean>, BeanError> {
        (self.restorer)(state)
    }

    pub(crate) fn method_interceptors(&self) -> &[InterceptorBinding] {
        &self.method_interceptors
    }

    pub(crate) fn callback_interceptors(&self) -> &[InterceptorBinding] {
        &self.callback_interceptors
    }

    /// `true` once the deployment has been undeployed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for BeanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanContext")
            .field("id", &self.id)
            .field("default_transaction", &self.default_transaction)
            .field("methods", &self.methods.len())
            .field("session_synchronized", &self.session_synchronized)
            .field("passivable", &self.passivable)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
