// # Contact Cache Implementations
//
// This module provides implementations of the ContactCache trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::{FileContactCache, FileContactCacheFactory};
pub use memory::{MemoryContactCache, MemoryContactCacheFactory};
