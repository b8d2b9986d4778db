pub mod clean;
pub mod config;
pub mod download;

// Re-export all handlers
pub use clean::handle_clean;
pub use config::handle_config;
pub use download::handle_download;
