//! Dual-write / smart-read data layer over a document store and a realtime
//! tree store.
//!
//! [`DualStoreSync`] is the entry point. Build it from a [`StoreContext`],
//! either with the REST clients ([`StoreContext::remote`]) or with in-memory
//! stores ([`StoreContext::in_memory`]).

pub mod auth;
pub mod config;
pub mod context;
pub mod models;
pub mod store;
pub mod subscription;
pub mod sync;

pub use auth::{AuthSession, AuthUser, IdentityClient};
pub use context::StoreContext;
pub use models::{Record, TestAttempt, User};
pub use subscription::Subscription;
pub use sync::{ConnectionStatus, DualStoreSync, StoreKind, SyncError};
