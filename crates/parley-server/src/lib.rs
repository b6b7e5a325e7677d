pub mod auth;
pub mod error;
pub mod handlers;
pub mod reply;
pub mod server;

pub use auth::{Authenticator, StaticTokenAuth};
pub use error::ApiError;
pub use reply::{ReplyOutcome, ReplyPipeline, DEFAULT_CONTEXT_WINDOW};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
