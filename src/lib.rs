pub mod config;
pub mod error;
pub mod http;
pub mod listener;
pub mod prober;
pub mod registry;
pub mod scheduler;
pub mod wire;

pub use http::{build_router, AppState};
