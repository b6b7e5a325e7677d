use std::sync::Arc;

use tracing::{instrument, warn};

use parley_core::agents::{AgentCatalog, AgentConfig};
use parley_core::ids::{SessionId, UserId};
use parley_core::messages::{ChatMessage, Role};
use parley_llm::{CompletionClient, CompletionError};
use parley_store::events::{EventRepo, EventRow};
use parley_store::sessions::SessionRepo;
use parley_store::StoreError;

/// How many trailing events are replayed to the model on each turn.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 50;

const TITLE_MAX_CHARS: usize = 50;

/// Both halves of a completed reply cycle, in the order they were appended.
#[derive(Debug)]
pub struct ReplyOutcome {
    pub user_event: EventRow,
    pub assistant_event: EventRow,
}

/// Runs a user message through one reply cycle: persist it, assemble the
/// context window, obtain assistant text, persist that too.
///
/// Once the user's message is stored, the cycle always finishes: a failed
/// completion call degrades into diagnostic assistant text instead of an
/// error, so the caller still receives two events.
pub struct ReplyPipeline {
    sessions: Arc<SessionRepo>,
    events: Arc<EventRepo>,
    catalog: Arc<AgentCatalog>,
    completion: Arc<dyn CompletionClient>,
    window: u32,
}

impl ReplyPipeline {
    pub fn new(
        sessions: Arc<SessionRepo>,
        events: Arc<EventRepo>,
        catalog: Arc<AgentCatalog>,
        completion: Arc<dyn CompletionClient>,
    ) -> Self {
        Self {
            sessions,
            events,
            catalog,
            completion,
            window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    #[instrument(skip(self, content), fields(session_id = %session_id, owner_id = %owner_id))]
    pub async fn send_message(
        &self,
        owner_id: &UserId,
        session_id: &SessionId,
        content: &str,
    ) -> Result<ReplyOutcome, StoreError> {
        // Ownership resolves before validation; a foreign session must not
        // reveal whether the content would have been acceptable.
        let session = self.sessions.get(session_id, owner_id)?;

        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::EmptyContent);
        }

        // The user's message is durable before the model is consulted.
        let user_event = self.events.append(session_id, Role::User, content)?;

        if session.title.is_none() {
            self.sessions
                .set_title_if_unset(session_id, &derive_title(content))?;
        }

        let context = self.events.build_context(session_id, self.window)?;

        // A stored key that has dropped out of the catalog falls back to the
        // first entry instead of stranding the session.
        let agent = match self.catalog.get(&session.agent_key) {
            Some(agent) => agent,
            None => {
                let fallback = self.catalog.default_agent();
                warn!(
                    agent_key = %session.agent_key,
                    fallback = %fallback.key,
                    "unknown agent key, using fallback"
                );
                fallback
            }
        };

        let assistant_content = match self.completion.complete(agent.model_id(), &context).await {
            Ok(text) => text,
            Err(err) => synthesize_failure(agent, &context, &err),
        };

        let assistant_event = self
            .events
            .append(session_id, Role::Assistant, &assistant_content)?;

        // Exactly one recency bump per cycle, after both halves are stored.
        self.sessions.touch(session_id)?;

        Ok(ReplyOutcome {
            user_event,
            assistant_event,
        })
    }
}

/// Stand-in assistant text for a completion that produced none.
fn synthesize_failure(agent: &AgentConfig, context: &[ChatMessage], err: &CompletionError) -> String {
    match err {
        CompletionError::NoCredential => {
            let last_user = context
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("");
            format!(
                "({}) I’m running in mock mode (no OPENROUTER_API_KEY). You said:\n\n{}",
                agent.name, last_user
            )
        }
        CompletionError::Http {
            status,
            status_text,
            body,
        } => {
            let mut message = format!(
                "({}) Error calling OpenRouter: {} {}",
                agent.name, status, status_text
            );
            if !body.is_empty() {
                message.push_str("\n\n");
                message.push_str(body);
            }
            message
        }
        CompletionError::Network(detail) => {
            format!("({}) Error calling OpenRouter: {}", agent.name, detail)
        }
        CompletionError::Empty => format!("({}) Empty response from model.", agent.name),
    }
}

/// First-message titles: up to 50 characters of the content, with an
/// ellipsis marking a cut.
fn derive_title(content: &str) -> String {
    let mut chars = content.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}…")
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::{MockCompletion, MockReply};
    use parley_store::Database;

    struct Harness {
        sessions: Arc<SessionRepo>,
        events: Arc<EventRepo>,
        owner: UserId,
    }

    fn setup(completion: Arc<dyn CompletionClient>) -> (ReplyPipeline, Harness) {
        let db = Database::in_memory().unwrap();
        let sessions = Arc::new(SessionRepo::new(db.clone()));
        let events = Arc::new(EventRepo::new(db));
        let catalog = Arc::new(AgentCatalog::builtin());
        let pipeline = ReplyPipeline::new(
            Arc::clone(&sessions),
            Arc::clone(&events),
            catalog,
            completion,
        );
        let harness = Harness {
            sessions,
            events,
            owner: UserId::from_raw("user_alice"),
        };
        (pipeline, harness)
    }

    #[tokio::test]
    async fn successful_send_stores_two_events_and_bumps_session() {
        let mock = Arc::new(MockCompletion::always("model reply"));
        let (pipeline, h) = setup(mock.clone());
        let session = h.sessions.create(&h.owner, "helper", Some("t")).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hello")
            .await
            .unwrap();

        assert_eq!(outcome.user_event.role, Role::User);
        assert_eq!(outcome.user_event.content, "hello");
        assert_eq!(outcome.assistant_event.role, Role::Assistant);
        assert_eq!(outcome.assistant_event.content, "model reply");
        assert!(outcome.user_event.sequence < outcome.assistant_event.sequence);

        assert_eq!(h.events.count(&session.id).unwrap(), 2);
        let fetched = h.sessions.get(&session.id, &h.owner).unwrap();
        assert!(fetched.updated_at > session.updated_at);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_session_stores_nothing() {
        let mock = Arc::new(MockCompletion::always("unused"));
        let (pipeline, h) = setup(mock.clone());

        let missing = SessionId::from_raw("sess_gone");
        let result = pipeline.send_message(&h.owner, &missing, "hello").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(h.events.count(&missing).unwrap(), 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn foreign_session_stores_nothing() {
        let mock = Arc::new(MockCompletion::always("unused"));
        let (pipeline, h) = setup(mock.clone());
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let stranger = UserId::from_raw("user_bob");
        let result = pipeline.send_message(&stranger, &session.id, "hello").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        assert_eq!(h.events.count(&session.id).unwrap(), 0);
        let fetched = h.sessions.get(&session.id, &h.owner).unwrap();
        assert_eq!(fetched.updated_at, session.updated_at);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn blank_content_stores_nothing() {
        let mock = Arc::new(MockCompletion::always("unused"));
        let (pipeline, h) = setup(mock.clone());
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let result = pipeline.send_message(&h.owner, &session.id, "   \n ").await;
        assert!(matches!(result, Err(StoreError::EmptyContent)));
        assert_eq!(h.events.count(&session.id).unwrap(), 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn no_credential_degrades_to_mock_mode_echo() {
        let mock = Arc::new(MockCompletion::script(vec![MockReply::Fail(
            CompletionError::NoCredential,
        )]));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hello")
            .await
            .unwrap();

        assert_eq!(
            outcome.assistant_event.content,
            "(Helper) I’m running in mock mode (no OPENROUTER_API_KEY). You said:\n\nhello"
        );
        assert_eq!(h.events.count(&session.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn http_failure_embeds_status_and_body() {
        let mock = Arc::new(MockCompletion::script(vec![MockReply::Fail(
            CompletionError::Http {
                status: 502,
                status_text: "Bad Gateway".to_string(),
                body: "upstream exploded".to_string(),
            },
        )]));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "debugger", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hi")
            .await
            .unwrap();
        assert_eq!(
            outcome.assistant_event.content,
            "(Debugger) Error calling OpenRouter: 502 Bad Gateway\n\nupstream exploded"
        );
    }

    #[tokio::test]
    async fn http_failure_without_body_has_no_trailing_blank() {
        let mock = Arc::new(MockCompletion::script(vec![MockReply::Fail(
            CompletionError::Http {
                status: 429,
                status_text: "Too Many Requests".to_string(),
                body: String::new(),
            },
        )]));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hi")
            .await
            .unwrap();
        assert_eq!(
            outcome.assistant_event.content,
            "(Helper) Error calling OpenRouter: 429 Too Many Requests"
        );
    }

    #[tokio::test]
    async fn empty_reply_becomes_placeholder() {
        let mock = Arc::new(MockCompletion::script(vec![MockReply::Fail(
            CompletionError::Empty,
        )]));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hi")
            .await
            .unwrap();
        assert_eq!(
            outcome.assistant_event.content,
            "(Helper) Empty response from model."
        );
    }

    #[tokio::test]
    async fn network_failure_still_completes_the_cycle() {
        let mock = Arc::new(MockCompletion::script(vec![MockReply::Fail(
            CompletionError::Network("connection refused".to_string()),
        )]));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hi")
            .await
            .unwrap();
        assert_eq!(
            outcome.assistant_event.content,
            "(Helper) Error calling OpenRouter: connection refused"
        );
        assert_eq!(h.events.count(&session.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_agent_key_falls_back_to_first_entry() {
        let mock = Arc::new(MockCompletion::always("ok"));
        let (pipeline, h) = setup(mock.clone());
        // The registry accepts any key; eager checking is the handlers' job.
        let session = h.sessions.create(&h.owner, "ghost", None).unwrap();

        let outcome = pipeline
            .send_message(&h.owner, &session.id, "hello")
            .await
            .unwrap();
        assert_eq!(outcome.assistant_event.content, "ok");

        let calls = mock.calls();
        assert_eq!(calls[0].model, AgentCatalog::builtin().default_agent().model_id());
    }

    #[tokio::test]
    async fn context_window_replays_only_the_tail() {
        let mock = Arc::new(MockCompletion::always("ok"));
        let (pipeline, h) = setup(mock.clone());
        let pipeline = pipeline.with_window(5);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        for i in 0..8 {
            h.events
                .append(&session.id, Role::User, &format!("old {i}"))
                .unwrap();
        }

        pipeline
            .send_message(&h.owner, &session.id, "newest")
            .await
            .unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        let messages = &calls[0].messages;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages.last().unwrap().content, "newest");
        assert_eq!(messages[0].content, "old 4");
    }

    #[tokio::test]
    async fn context_includes_the_new_user_message() {
        let mock = Arc::new(MockCompletion::always("ok"));
        let (pipeline, h) = setup(mock.clone());
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        pipeline
            .send_message(&h.owner, &session.id, "hello")
            .await
            .unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].messages, vec![ChatMessage::user("hello")]);
    }

    #[tokio::test]
    async fn first_message_titles_the_session() {
        let mock = Arc::new(MockCompletion::always("ok"));
        let (pipeline, h) = setup(mock);
        let session = h.sessions.create(&h.owner, "helper", None).unwrap();

        pipeline
            .send_message(&h.owner, &session.id, "plan a trip to Lisbon")
            .await
            .unwrap();
        let fetched = h.sessions.get(&session.id, &h.owner).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("plan a trip to Lisbon"));

        pipeline
            .send_message(&h.owner, &session.id, "second message")
            .await
            .unwrap();
        let fetched = h.sessions.get(&session.id, &h.owner).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("plan a trip to Lisbon"));
    }

    #[tokio::test]
    async fn explicit_title_is_never_overwritten() {
        let mock = Arc::new(MockCompletion::always("ok"));
        let (pipeline, h) = setup(mock);
        let session = h
            .sessions
            .create(&h.owner, "helper", Some("Chosen title"))
            .unwrap();

        pipeline
            .send_message(&h.owner, &session.id, "hello")
            .await
            .unwrap();
        let fetched = h.sessions.get(&session.id, &h.owner).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Chosen title"));
    }

    #[test]
    fn titles_truncate_on_character_boundaries() {
        assert_eq!(derive_title("short"), "short");

        let exactly_fifty = "x".repeat(50);
        assert_eq!(derive_title(&exactly_fifty), exactly_fifty);

        let long = "y".repeat(51);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 51);
        assert!(title.ends_with('…'));

        let accented = "é".repeat(60);
        let title = derive_title(&accented);
        assert_eq!(title.chars().count(), 51);
        assert!(title.starts_with('é'));
    }
}
