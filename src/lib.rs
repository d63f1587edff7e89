#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Softcache provides in-process caches that give memory back when the process
//! runs short of it.
//!
//! - [`CacheTable`] is a thread-safe hash table whose values are held behind
//!   weak or strong references. When asked by its [`MemoryAuthority`], it
//!   releases a computed share of its content, least recently accessed first.
//! - [`LongKeyMap`] is a single-threaded map from `i64` keys to values. It keeps
//!   keys sharing one value as a plain key list and builds its hash table only
//!   when it has to.
//! - [`TidyUpScheduler`] runs small, low-priority eviction passes on a
//!   background thread.
//! - [`MemoryRegistry`] is a simple memory authority: it tracks the registered
//!   caches and drains them by [`Cost`] tier, cheapest first.
//!
//! # Example
//!
//! ```rust
//! use softcache::{CacheTable, Cost};
//!
//! let cache = CacheTable::builder()
//!     .name("thumbnails")
//!     .cost(Cost::Low)
//!     .average_size(4_096)
//!     .build()
//!     .unwrap();
//!
//! let thumbnail = cache.insert("cat.png", vec![0_u8; 4_096]);
//! assert_eq!(cache.get("cat.png").map(|t| t.len()), Some(thumbnail.len()));
//!
//! // Release half of the content: the least recently accessed entries go first.
//! let released = cache.free_memory(0.5).unwrap();
//! assert!(released > 0);
//! ```

pub mod authority;
pub mod long_map;
pub mod table;
pub mod tidy_up;

pub(crate) mod common;
mod cost;

pub use {
    authority::{CacheId, Evictable, MemoryAuthority, MemoryRegistry},
    common::error::ConfigError,
    cost::Cost,
    long_map::{KeyOrder, LongKeyMap},
    table::{CacheTable, CacheTableBuilder},
    tidy_up::TidyUpScheduler,
};
