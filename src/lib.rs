pub mod api;
pub mod cache;
pub mod config;
pub mod ingest;
pub mod replicate;
pub mod retention;
pub mod state;
pub mod store;

pub const VERSION: f32 = 0.1;
pub const CONFIG_VERSION: f32 = 0.1;
