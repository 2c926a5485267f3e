//! Collaborators the container calls out to.
//!
//! The container does not authenticate callers or manage persistence contexts
//! itself. It asks a [`SecurityService`] before each call and notifies an
//! [`ExtendedContextRegistry`] around each call, so those concerns can be plugged
//! in per container.

use crate::container::SessionId;
use crate::transaction::TransactionManager;
use std::fmt;
use std::sync::Arc;

/// Authorizes container calls.
pub trait SecurityService: Send + Sync {
    /// `true` if the current caller may invoke `method` on `deployment_id`.
    fn is_caller_authorized(&self, deployment_id: &str, method: &str) -> bool;
}

/// Allows every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl SecurityService for PermitAll {
    fn is_caller_authorized(&self, _deployment_id: &str, _method: &str) -> bool {
        true
    }
}

/// Tracks per-session extended contexts (for example persistence contexts that
/// live as long as the session).
pub trait ExtendedContextRegistry: Send + Sync {
    /// The session is about to run a call.
    fn enter(&self, deployment_id: &str, session: SessionId);

    /// The session finished a call.
    fn exit(&self, deployment_id: &str, session: SessionId);

    /// The session was removed; its contexts can be closed.
    fn close(&self, deployment_id: &str, session: SessionId);
}

/// Registry that keeps no contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtendedContexts;

impl ExtendedContextRegistry for NoExtendedContexts {
    fn enter(&self, _deployment_id: &str, _session: SessionId) {}

    fn exit(&self, _deployment_id: &str, _session: SessionId) {}

    fn close(&self, _deployment_id: &str, _session: SessionId) {}
}

/// Everything a container needs from its environment.
#[derive(Clone)]
pub struct ContainerServices {
    /// Transaction service.
    pub transactions: Arc<TransactionManager>,
    /// Call authorization.
    pub security: Arc<dyn SecurityService>,
    /// Extended context tracking.
    pub contexts: Arc<dyn ExtendedContextRegistry>,
}

impl ContainerServices {
    /// Services with permissive security and no extended contexts.
    pub fn new(transactions: Arc<TransactionManager>) -> Self {
        Self {
            transactions,
            security: Arc::new(PermitAll),
            contexts: Arc::new(NoExtendedContexts),
        }
    }

    /// Replaces the security service.
    pub fn with_security(mut self, security: Arc<dyn SecurityService>) -> Self {
        self.security = security;
        self
    }

    /// Replaces the extended context registry.
    pub fn with_contexts(mut self, contexts: Arc<dyn ExtendedContextRegistry>) -> Self {
        self.contexts = contexts;
        self
    }
}

impl fmt::Debug for ContainerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerServices")
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}
