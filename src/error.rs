//! Error types for the instance cache, passivation, transactions and the container.
//!
//! Each layer has its own enum; the container error wraps the lower layers with
//! `#[from]` so dispatch code can propagate with `?`.

use crate::bean::BeanError;
use crate::container::SessionId;
use crate::transaction::TransactionId;
use thiserror::Error;

/// Boxed error returned by listener and synchronization callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by [`InstanceCache`](crate::InstanceCache) operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `add` was called for a key that is already live in the cache.
    #[error("entry {0} already exists in the cache")]
    AlreadyExists(String),

    /// `check_out` found the entry checked out by another caller.
    #[error("entry {0} is already checked out")]
    AlreadyCheckedOut(String),

    /// `check_in` was called for an entry that was never checked out.
    #[error("entry {0} is not checked out")]
    NotCheckedOut(String),

    /// `check_out` kept observing a passivated entry in the index.
    #[error("cache is corrupted: entry {0} was repeatedly observed as passivated")]
    Corrupted(String),

    /// The listener refused a freshly activated value.
    #[error("activated entry {key} was refused by the cache listener: {source}")]
    Load {
        /// Key of the refused entry.
        key: String,
        /// Listener failure.
        #[source]
        source: BoxError,
    },

    /// Reading the entry back from the passivation store failed.
    #[error(transparent)]
    Passivation(#[from] PassivationError),
}

/// Errors raised while storing or restoring passivated values.
#[derive(Debug, Error)]
pub enum PassivationError {
    /// File system failure in a directory-backed store.
    #[error("passivation i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be serialized or parsed.
    #[error("snapshot codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// The stored snapshot was written by an incompatible format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// The snapshot names a deployment that is no longer deployed.
    #[error("no deployment {0} to restore the snapshot into")]
    UnknownDeployment(String),

    /// The bean refused to produce or accept its snapshot.
    #[error("bean state could not be captured or restored: {0}")]
    Bean(#[source] BeanError),
}

/// Errors raised by transactions and transaction policies.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A `Mandatory` method was called without a transaction.
    #[error("a transaction is required but the caller has none")]
    Required,

    /// A `Never` method was called inside a transaction.
    #[error("the caller's transaction is not allowed for this method")]
    NotAllowed,

    /// The transaction has already completed.
    #[error("transaction {0} is not active")]
    NotActive(TransactionId),

    /// Commit was attempted but the transaction rolled back.
    #[error("transaction {id} was rolled back: {cause}")]
    RolledBack {
        /// Transaction that rolled back.
        id: TransactionId,
        /// Why it rolled back.
        cause: String,
    },

    /// `begin` was called while a user transaction is already in progress.
    #[error("nested user transactions are not supported")]
    NestedNotSupported,

    /// A user transaction operation was called without a transaction.
    #[error("no user transaction is in progress")]
    NoTransaction,
}

/// Errors surfaced to callers of the container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The call named a deployment that is not deployed in this container.
    #[error("deployment {deployment} does not exist in container {container}")]
    DeploymentNotFound {
        /// Requested deployment id.
        deployment: String,
        /// Container id.
        container: String,
    },

    /// A business or remove call carried no session id.
    #[error("cannot invoke a stateful session without a session id")]
    NullPrimaryKey,

    /// The session id does not name a live instance.
    #[error("session {0} does not exist")]
    InvalidReference(SessionId),

    /// The instance is already servicing another call.
    #[error("concurrent calls on session {0} are not allowed")]
    ConcurrentAccess(SessionId),

    /// The instance is bound to a different transaction.
    #[error("session {0} is bound to another transaction")]
    TransactionAffinity(SessionId),

    /// The security service denied the call.
    #[error("caller is not authorized to invoke {method}")]
    Unauthorized {
        /// Method that was denied.
        method: String,
    },

    /// The bean raised a declared application exception.
    #[error("application exception: {0}")]
    Application(BeanError),

    /// A system failure; the instance involved has been discarded.
    #[error("system exception: {message}")]
    System {
        /// Failure description.
        message: String,
        /// Underlying failure, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A system failure inside the caller's transaction, which is now rollback-only.
    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),

    /// Transaction policy or completion failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Instance cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ContainerError {
    /// Returns `true` if the session no longer exists.
    pub fn is_invalid_reference(&self) -> bool {
        matches!(self, ContainerError::InvalidReference(_))
    }

    /// Returns `true` if the error is an application exception the caller should handle.
    pub fn is_application(&self) -> bool {
        matches!(self, ContainerError::Application(_))
    }

    /// Returns `true` for system-level failures.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            ContainerError::NullPrimaryKey
                | ContainerError::System { .. }
                | ContainerError::TransactionRolledBack(_)
        )
    }
}

/// Errors raised while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A property value could not be parsed.
    #[error("invalid value {value:?} for property {property}")]
    InvalidProperty {
        /// Property name.
        property: String,
        /// Offending value.
        value: String,
    },
}
