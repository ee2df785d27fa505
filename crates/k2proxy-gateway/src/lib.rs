pub mod app;
pub mod auth;
pub mod error;
pub mod http;

pub use app::{bootstrap, build_router, AppState};
