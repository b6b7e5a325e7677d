pub mod client;
pub mod models;

pub mod mock;

pub use client::{CompletionClient, CompletionError, OpenRouterClient, OPENROUTER_BASE_URL};
pub use mock::{CompletionCall, MockCompletion, MockReply};
