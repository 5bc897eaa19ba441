pub mod answer;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod openai;
pub mod qdrant_store;
pub mod retrieval;
pub mod retry;
pub mod server;
pub mod traits;
pub mod ui;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use server::{build_router, run_server, AppState};
