//! Core traits for the address book bridge
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`NativeStore`]: Query, read and write the platform address book
//! - [`ContactCache`]: Persist last-seen contact snapshots across restarts

pub mod native_store;
pub mod contact_cache;

pub use native_store::{NativeStore, NativeStoreFactory, ChangeStream};
pub use contact_cache::{ContactCache, CachedContact, ContactCacheFactory};
