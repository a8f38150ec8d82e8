pub mod api;
pub mod auth;
pub mod config;
pub mod import;
pub mod reports;
pub mod sqlite_storage;
pub mod storage;
