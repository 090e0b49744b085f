pub mod cache;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod geometry;
pub mod index;
pub mod mapper;
pub mod models;
pub mod ollama;
pub mod prompt;
pub mod providers;
pub mod render;
pub mod retrieval;
pub mod selection;
pub mod server;
pub mod session;

pub use config::AppConfig;
pub use error::AskError;
pub use server::run_server;
