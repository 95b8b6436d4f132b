//! Search index adapters.

mod in_memory;
mod meilisearch;

pub use in_memory::{InMemoryIndex, IndexDocument};
pub use meilisearch::MeilisearchIndex;
