pub mod config;
pub mod error;
pub mod schedule;
pub mod storage;
pub mod tools;
pub mod utils;
pub mod web;

use std::sync::Arc;

use once_cell::sync::Lazy;

use schedule::TaskService;

pub struct AppContext {
    pub service: Arc<TaskService>,
}

pub static DATABASE_URL: Lazy<String> = Lazy::new(|| {
    config::lookup("SUBKEEPER_DATABASE_URL")
        .unwrap_or_else(|| config::DEFAULT_DATABASE_URL.to_string())
});

pub static BACKUP_DIR: Lazy<String> = Lazy::new(|| {
    config::lookup("SUBKEEPER_BACKUP_DIR")
        .unwrap_or_else(|| config::DEFAULT_BACKUP_DIR.to_string())
});

/// Loads `.env` and makes sure the data directories exist.
pub fn init_env() {
    dotenv::dotenv().ok();

    if let Some(db_path) = DATABASE_URL.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(dir) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| {
                eprintln!("Failed to create database directory: {}", e);
            });
        }
    }
    std::fs::create_dir_all(BACKUP_DIR.as_str()).unwrap_or_else(|e| {
        eprintln!("Failed to create backup directory: {}", e);
    });
}
