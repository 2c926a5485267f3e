//! Interceptor chains.
//!
//! Every call on a bean, business method or lifecycle callback, runs through an
//! [`InterceptorStack`]: the deployment's interceptors in registration order, then
//! the bean itself. Each interceptor receives an [`InvocationContext`] and decides
//! whether and when to [`proceed`](InvocationContext::proceed).
//!
//! ```text
//!  invoke(args) ──▶ interceptor 0 ──proceed──▶ interceptor 1 ──proceed──▶ bean
//!                        ▲                          ▲                      │
//!                        └────────── result ────────┴──────────────────────┘
//! ```
//!
//! Interceptors are shared per deployment, so per-session interceptor state lives
//! in the instance and is reached through
//! [`interceptor_state`](InvocationContext::interceptor_state). It is passivated
//! with the bean.

use crate::bean::{BeanError, SessionBean};
use crate::transaction::UserTransaction;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What a call on a bean is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create method.
    Create,
    /// Business method.
    Business,
    /// Remove method.
    Remove,
    /// Post-construct callback.
    PostConstruct,
    /// Pre-destroy callback.
    PreDestroy,
    /// Post-activate callback.
    Activate,
    /// Pre-passivate callback.
    Passivate,
    /// Session synchronization: transaction joined.
    AfterBegin,
    /// Session synchronization: before completion.
    BeforeCompletion,
    /// Session synchronization: after completion.
    AfterCompletion,
}

impl Operation {
    /// `true` for the completion callbacks, which may run on an instance that is
    /// marked in use.
    pub fn is_completion_callback(self) -> bool {
        matches!(self, Operation::BeforeCompletion | Operation::AfterCompletion)
    }

    /// `true` for lifecycle and session synchronization callbacks.
    pub fn is_callback(self) -> bool {
        !matches!(
            self,
            Operation::Create | Operation::Business | Operation::Remove
        )
    }
}

type InterceptorFn = dyn Fn(&mut InvocationContext<'_>) -> Result<Value, BeanError> + Send + Sync;

/// A named interceptor.
#[derive(Clone)]
pub struct InterceptorBinding {
    name: String,
    callback: Arc<InterceptorFn>,
}

impl InterceptorBinding {
    /// Wraps an interceptor function.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>) -> Result<Value, BeanError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }

    /// Interceptor name; also the key of its per-session state.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for InterceptorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorBinding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// State of one call travelling down an interceptor chain.
pub struct InvocationContext<'a> {
    operation: Operation,
    method: Option<&'a str>,
    args: Vec<Value>,
    bean: &'a mut dyn SessionBean,
    state: &'a mut BTreeMap<String, Value>,
    chain: &'a [InterceptorBinding],
    position: usize,
    current: Option<&'a str>,
    user_transaction: Option<&'a UserTransaction>,
}

impl<'a> InvocationContext<'a> {
    /// What the call is doing.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Method name for create, business and remove calls.
    pub fn method(&self) -> Option<&str> {
        self.method
    }

    /// Call arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Call arguments, for interceptors that rewrite them.
    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    /// Per-session state of the running interceptor. Starts as `Null`.
    pub fn interceptor_state(&mut self) -> &mut Value {
        let name = self.current.unwrap_or_default();
        self.state.entry(name.to_string()).or_insert(Value::Null)
    }

    /// User transaction of a bean-managed call.
    pub fn user_transaction(&self) -> Option<&UserTransaction> {
        self.user_transaction
    }

    /// Runs the rest of the chain and returns its result.
    pub fn proceed(&mut self) -> Result<Value, BeanError> {
        let chain = self.chain;
        let Some(binding) = chain.get(self.position) else {
            return self.invoke_target();
        };
        let previous = self.current.replace(binding.name.as_str());
        self.position += 1;
        let result = (binding.callback)(self);
        self.position -= 1;
        self.current = previous;
        result
    }

    fn invoke_target(&mut self) -> Result<Value, BeanError> {
        let method = self.method.unwrap_or_default();
        match self.operation {
            Operation::Business | Operation::Remove => self.bean.invoke(method, &self.args),
            Operation::Create => self.bean.create(method, &self.args).map(|()| Value::Null),
            Operation::PostConstruct => self.bean.post_construct().map(|()| Value::Null),
            Operation::PreDestroy => self.bean.pre_destroy().map(|()| Value::Null),
            Operation::Activate => self.bean.post_activate().map(|()| Value::Null),
            Operation::Passivate => self.bean.pre_passivate().map(|()| Value::Null),
            Operation::AfterBegin => self.bean.after_begin().map(|()| Value::Null),
            Operation::BeforeCompletion => self.bean.before_completion().map(|()| Value::Null),
            Operation::AfterCompletion => {
                let committed = self.args.first().and_then(Value::as_bool).unwrap_or(false);
                self.bean.after_completion(committed).map(|()| Value::Null)
            }
        }
    }
}

impl fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("operation", &self.operation)
            .field("method", &self.method)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Builds and runs an interceptor chain for one call.
pub struct InterceptorStack<'a> {
    context: InvocationContext<'a>,
}

impl<'a> InterceptorStack<'a> {
    /// Prepares a chain of `interceptors` around `bean`.
    pub fn new(
        bean: &'a mut dyn SessionBean,
        operation: Operation,
        method: Option<&'a str>,
        interceptors: &'a [InterceptorBinding],
        state: &'a mut BTreeMap<String, Value>,
    ) -> Self {
        Self {
            context: InvocationContext {
                operation,
                method,
                args: Vec::new(),
                bean,
                state,
                chain: interceptors,
                position: 0,
                current: None,
                user_transaction: None,
            },
        }
    }

    /// Makes the bean's user transaction visible to interceptors.
    pub fn with_user_transaction(mut self, user_transaction: Option<&'a UserTransaction>) -> Self {
        self.context.user_transaction = user_transaction;
        self
    }

    /// Runs the chain.
    pub fn invoke(mut self, args: Vec<Value>) -> Result<Value, BeanError> {
        self.context.args = args;
        self.context.proceed()
    }
}

impl fmt::Debug for InterceptorStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorStack")
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        events: Vec<String>,
    }

    impl SessionBean for Echo {
        fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, BeanError> {
            self.events.push(method.to_string());
            Ok(json!({ "method": method, "args": args }))
        }

        fn after_completion(&mut self, committed: bool) -> Result<(), BeanError> {
            self.events.push(format!("after_completion:{committed}"));
            Ok(())
        }

        fn snapshot(&self) -> Result<Value, BeanError> {
            Ok(json!(self.events))
        }
    }

    #[test]
    fn test_chain_runs_in_order_and_rewrites_args() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first_order = Arc::clone(&order);
        let second_order = Arc::clone(&order);
        let interceptors = vec![
            InterceptorBinding::new("first", move |ctx: &mut InvocationContext<'_>| {
                first_order.lock().push("first");
                ctx.args_mut().push(json!(1));
                ctx.proceed()
            }),
            InterceptorBinding::new("second", move |ctx: &mut InvocationContext<'_>| {
                second_order.lock().push("second");
                ctx.proceed()
            }),
        ];
        let mut bean = Echo { events: Vec::new() };
        let mut state = BTreeMap::new();
        let result = InterceptorStack::new(
            &mut bean,
            Operation::Business,
            Some("greet"),
            &interceptors,
            &mut state,
        )
        .invoke(vec![json!("hi")])
        .unwrap();

        assert_eq!(result, json!({ "method": "greet", "args": ["hi", 1] }));
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(bean.events, vec!["greet"]);
    }

    #[test]
    fn test_interceptor_can_short_circuit() {
        let interceptors = vec![InterceptorBinding::new(
            "deny",
            |_: &mut InvocationContext<'_>| Err(BeanError::application("Denied", "no")),
        )];
        let mut bean = Echo { events: Vec::new() };
        let mut state = BTreeMap::new();
        let result = InterceptorStack::new(
            &mut bean,
            Operation::Business,
            Some("greet"),
            &interceptors,
            &mut state,
        )
        .invoke(Vec::new());
        assert!(result.is_err());
        assert!(bean.events.is_empty());
    }

    #[test]
    fn test_interceptor_state_is_keyed_by_name() {
        let interceptors = vec![InterceptorBinding::new(
            "counter",
            |ctx: &mut InvocationContext<'_>| {
                let state = ctx.interceptor_state();
                let next = state.as_i64().unwrap_or(0) + 1;
                *state = json!(next);
                ctx.proceed()
            },
        )];
        let mut bean = Echo { events: Vec::new() };
        let mut state = BTreeMap::new();
        for _ in 0..3 {
            InterceptorStack::new(
                &mut bean,
                Operation::Business,
                Some("tick"),
                &interceptors,
                &mut state,
            )
            .invoke(Vec::new())
            .unwrap();
        }
        assert_eq!(state["counter"], json!(3));
    }

    #[test]
    fn test_after_completion_reads_committed_flag() {
        let mut bean = Echo { events: Vec::new() };
        let mut state = BTreeMap::new();
        InterceptorStack::new(&mut bean, Operation::AfterCompletion, None, &[], &mut state)
            .invoke(vec![json!(true)])
            .unwrap();
        assert_eq!(bean.events, vec!["after_completion:true"]);
    }
}
