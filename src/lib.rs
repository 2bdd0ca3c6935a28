pub mod change_detector;
pub mod chunker;
pub mod config;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod indexer;
pub mod metadata_extractor;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod store;
pub mod walker;
pub mod writer;
