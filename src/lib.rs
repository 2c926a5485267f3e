#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Code Reference
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          StatefulContainer                               │
//! │                                                                          │
//! │   Call ──▶ dispatch ──▶ TransactionPolicy ──▶ obtain instance            │
//! │                │                                    │                    │
//! │                │                  ┌─────────────────┴───────────────┐    │
//! │                │                  ▼                                 ▼    │
//! │                │        ┌───────────────────┐          ┌──────────────┐  │
//! │                │        │ CheckedOutRegistry│          │InstanceCache │  │
//! │                │        │ (in-transaction)  │          │ checkOut/In  │  │
//! │                │        └───────────────────┘          │ LRU, timeout │  │
//! │                │                                       └──────┬───────┘  │
//! │                ▼                                              ▼          │
//! │      SessionSynchronization                        PassivationStrategy   │
//! │      Coordinator (per tx)                          (memory / directory)  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Type | Role |
//! |------|------|
//! | [`StatefulContainer`] | Deploys bean types and dispatches create, business and remove calls |
//! | [`InstanceCache`] | Checkout/checkin cache with LRU passivation and idle timeouts |
//! | [`TransactionManager`] | Local transactions, policies and synchronization callbacks |
//! | [`BeanContext`] | Per-deployment metadata: method table, exception classes, interceptors |
//!
//! ## Example
//!
//! ```rust
//! use serde_json::{json, Value};
//! use stateful_rs::bean::{BeanContext, BeanError, MethodInfo, SessionBean};
//! use stateful_rs::config::ContainerConfig;
//! use stateful_rs::{Call, StatefulContainer, TransactionManager};
//!
//! struct Cart {
//!     items: Vec<String>,
//! }
//!
//! impl SessionBean for Cart {
//!     fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, BeanError> {
//!         match method {
//!             "add" => {
//!                 self.items.push(args[0].as_str().unwrap_or_default().to_string());
//!                 Ok(json!(self.items.len()))
//!             }
//!             _ => Ok(json!(self.items)),
//!         }
//!     }
//!
//!     fn snapshot(&self) -> Result<Value, BeanError> {
//!         Ok(json!(self.items))
//!     }
//! }
//!
//! let container = StatefulContainer::new(
//!     "stateful",
//!     ContainerConfig::default(),
//!     TransactionManager::new(),
//! )
//! .unwrap();
//! container.deploy(
//!     BeanContext::new(
//!         "cart",
//!         || Ok(Box::new(Cart { items: Vec::new() }) as Box<dyn SessionBean>),
//!         |state| {
//!             let items = serde_json::from_value(state).map_err(|e| BeanError::system(e.to_string()))?;
//!             Ok(Box::new(Cart { items }) as Box<dyn SessionBean>)
//!         },
//!     )
//!     .with_method("create", MethodInfo::create())
//!     .with_method("checkout", MethodInfo::remove()),
//! );
//!
//! let handle = container.create(Call::new("cart", "create")).unwrap();
//! let count = container
//!     .business(Call::new("cart", "add").on(handle.primary_key).with_args(vec![json!("book")]))
//!     .unwrap();
//! assert_eq!(count, json!(1));
//! container.remove(Call::new("cart", "checkout").on(handle.primary_key)).unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Bean-type metadata and the session bean contract.
pub mod bean;

/// Keyed instance cache with a checkout protocol, LRU eviction and passivation.
pub mod cache;

/// Configuration for the instance cache and the container.
pub mod config;

/// The stateful session container.
pub mod container;

/// Cache entry record and its state machine.
pub(crate) mod entry;

/// Error types.
pub mod error;

/// Interceptor chains around business methods and lifecycle callbacks.
pub mod interceptor;

/// Metrics reporting for the cache and the container.
pub mod metrics;

/// Passivation strategies and snapshot codecs.
pub mod passivation;

/// Recency queue used by the instance cache.
pub(crate) mod queue;

/// Collaborators injected into the container: security and extended contexts.
pub mod services;

/// Local transactions, synchronizations and transaction policies.
pub mod transaction;

#[cfg(feature = "hashbrown")]
pub(crate) use hashbrown::DefaultHashBuilder;
#[cfg(feature = "hashbrown")]
pub(crate) use hashbrown::HashMap;

#[cfg(not(feature = "hashbrown"))]
pub(crate) use std::collections::hash_map::RandomState as DefaultHashBuilder;
#[cfg(not(feature = "hashbrown"))]
pub(crate) use std::collections::HashMap;

pub use bean::{BeanContext, BeanError, SessionBean};
pub use cache::{CacheListener, InstanceCache};
pub use container::{Call, Reply, SessionHandle, SessionId, StatefulContainer};
pub use error::{CacheError, ContainerError, PassivationError, TransactionError};
pub use transaction::{Transaction, TransactionManager};
