use serde::{Deserialize, Serialize};

/// Model used when an agent entry does not name one.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// One selectable agent: display metadata plus the model that answers for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub key: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentConfig {
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("agent catalog must not be empty")]
pub struct EmptyCatalog;

/// Immutable table of agents, built once at process start and passed by
/// reference into request handling. Never empty, so the default agent
/// always exists.
#[derive(Clone, Debug)]
pub struct AgentCatalog {
    agents: Vec<AgentConfig>,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentConfig>) -> Result<Self, EmptyCatalog> {
        if agents.is_empty() {
            return Err(EmptyCatalog);
        }
        Ok(Self { agents })
    }

    /// The stock catalog shipped with the server.
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                AgentConfig {
                    key: "helper".to_string(),
                    name: "Helper".to_string(),
                    description: "General-purpose assistant for everyday tasks.".to_string(),
                    model: Some(DEFAULT_MODEL.to_string()),
                },
                AgentConfig {
                    key: "debugger".to_string(),
                    name: "Debugger".to_string(),
                    description: "Helps debug code and explains failures step-by-step.".to_string(),
                    model: Some(DEFAULT_MODEL.to_string()),
                },
            ],
        }
    }

    pub fn get(&self, key: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.key == key)
    }

    /// Fallback agent for sessions whose stored key is no longer known.
    pub fn default_agent(&self) -> &AgentConfig {
        // new() rejects empty catalogs, so the first entry always exists.
        &self.agents[0]
    }

    pub fn agents(&self) -> &[AgentConfig] {
        &self.agents
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
