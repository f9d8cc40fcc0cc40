pub mod config;

pub use config::{AppConfig, DEFAULT_DATABASE_FILE, DEFAULT_LOG_FILTER};
