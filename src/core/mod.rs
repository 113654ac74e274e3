pub mod assistant;
pub mod indexer;
pub mod retriever;
pub mod services;
pub mod splitter;
pub mod traits;
