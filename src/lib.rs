pub mod admission;
pub mod app;
pub mod config;
pub mod handler;
pub mod media;
pub mod models;
pub mod signaling;
pub mod store;
pub mod version;
