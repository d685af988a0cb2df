//! Pure, deterministic logic: data types, templating, cache keys, status parsing.
//!
//! Nothing in this module touches the filesystem or spawns processes.

pub mod cache_key;
pub mod changeset;
pub mod env;
pub mod porcelain;
pub mod template;
pub mod types;
