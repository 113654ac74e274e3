pub mod database;
pub mod documents;
pub mod embeddings;
pub mod entities;
pub mod groq;
pub mod repositories;
pub mod traits;
pub mod vector_index;
