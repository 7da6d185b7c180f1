//! HTTP and WebSocket API for the recap pipeline engine.
//!
//! Admission, status queries, owner job listings, cancellation, quota
//! queries and the live progress subscription. Authentication is out of
//! scope: the caller's identity arrives in the `x-user-id` header, set
//! by the fronting session layer.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
