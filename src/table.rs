//! A generic cache table holding its values behind weak or strong references.

mod builder;
mod cache_table;
mod entry;

pub use {builder::CacheTableBuilder, cache_table::CacheTable};
