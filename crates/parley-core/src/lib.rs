pub mod agents;
pub mod ids;
pub mod messages;

pub use agents::{AgentCatalog, AgentConfig, EmptyCatalog, DEFAULT_MODEL};
pub use ids::{EventId, SessionId, UserId};
pub use messages::{ChatMessage, Role};
