//! The chat controller: a state machine between the presentation surface,
//! the streaming model client, and the session store.
//!
//! The surface dispatches [`ChatAction`]s; the controller mutates its state,
//! pushes [`ChatEvent`]s back over a bounded queue, and hands any deferred
//! work to the run loop as a [`ChatCommand`]. Stream output reaches it
//! through [`handle_stream_message`](ChatController::handle_stream_message),
//! tagged with the stream id it belongs to; messages from a superseded
//! stream are discarded.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatMessage, GenerationOptions};
use crate::core::chat_stream::{StreamError, StreamMessage, StreamParams};
use crate::core::constants::SESSION_LIST_LIMIT;
use crate::core::message::{Turn, TurnStatus};
use crate::store::{SessionMeta, SessionStore, StorageError};

/// User intents dispatched from the presentation surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    Submit { text: String },
    Stop,
    CopyLastReply,
    NewSession,
    OpenSession { session_id: i64 },
    RenameSession { session_id: i64, title: String },
    DeleteSession { session_id: i64 },
    ListSessions,
}

/// Events delivered to the presentation surface, in order.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    SessionOpened {
        session: SessionMeta,
        turns: Vec<Turn>,
    },
    SessionRenamed {
        session_id: i64,
        title: String,
    },
    SessionDeleted {
        session_id: i64,
    },
    SessionList {
        sessions: Vec<SessionMeta>,
    },
    TurnStarted {
        session_id: i64,
    },
    Fragment {
        session_id: i64,
        text: String,
    },
    TurnFinalized {
        session_id: i64,
        turn: Turn,
    },
    CopyText {
        text: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Deferred work the run loop executes on the controller's behalf.
pub enum ChatCommand {
    SpawnStream(StreamParams),
}

enum Phase {
    Idle,
    Streaming {
        stream_id: u64,
        cancel_token: CancellationToken,
        /// The single mutable in-progress turn. Owned here until finalized,
        /// at which point ownership transfers to the store.
        pending: Turn,
    },
}

pub struct ControllerParams {
    pub store: SessionStore,
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub options: Option<GenerationOptions>,
}

pub struct ChatController {
    store: SessionStore,
    client: reqwest::Client,
    base_url: String,
    model: String,
    options: Option<GenerationOptions>,
    events: mpsc::Sender<ChatEvent>,
    session: SessionMeta,
    /// In-memory transcript of the open session. Survives storage failures,
    /// so a broken history file degrades to warnings instead of lost context.
    turns: Vec<Turn>,
    phase: Phase,
    next_stream_id: u64,
}

impl ChatController {
    /// Build a controller with a fresh session. Failing to reach the store
    /// at startup is the one storage error that is not downgraded to a
    /// warning; there is no history to fall back on yet.
    pub async fn new(
        params: ControllerParams,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<Self, StorageError> {
        let session = params.store.create_session().await?;
        Ok(Self {
            store: params.store,
            client: params.client,
            base_url: params.base_url,
            model: params.model,
            options: params.options,
            events,
            session,
            turns: Vec::new(),
            phase: Phase::Idle,
            next_stream_id: 0,
        })
    }

    pub fn session(&self) -> &SessionMeta {
        &self.session
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn apply(&mut self, action: ChatAction) -> Option<ChatCommand> {
        match action {
            ChatAction::Submit { text } => self.submit(text).await,
            ChatAction::Stop => {
                self.stop().await;
                None
            }
            ChatAction::CopyLastReply => {
                self.copy_last_reply().await;
                None
            }
            ChatAction::NewSession => {
                self.new_session().await;
                None
            }
            ChatAction::OpenSession { session_id } => {
                self.open_session(session_id).await;
                None
            }
            ChatAction::RenameSession { session_id, title } => {
                self.rename_session(session_id, title).await;
                None
            }
            ChatAction::DeleteSession { session_id } => {
                self.delete_session(session_id).await;
                None
            }
            ChatAction::ListSessions => {
                self.list_sessions().await;
                None
            }
        }
    }

    /// Route one message from the stream worker. Messages tagged with a
    /// stream id other than the live one are stale and dropped.
    pub async fn handle_stream_message(&mut self, message: StreamMessage, stream_id: u64) {
        if !self.is_current_stream(stream_id) {
            return;
        }

        match message {
            StreamMessage::Chunk(text) => {
                if text.is_empty() {
                    return;
                }
                if let Phase::Streaming { pending, .. } = &mut self.phase {
                    pending.append_fragment(&text);
                }
                self.emit(ChatEvent::Fragment {
                    session_id: self.session.id,
                    text,
                })
                .await;
            }
            StreamMessage::Failed(error) => self.handle_stream_failure(error).await,
            StreamMessage::End => self.finalize_pending(TurnStatus::Complete).await,
        }
    }

    fn is_current_stream(&self, stream_id: u64) -> bool {
        matches!(&self.phase, Phase::Streaming { stream_id: current, .. } if *current == stream_id)
    }

    fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming { .. })
    }

    async fn submit(&mut self, text: String) -> Option<ChatCommand> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }

        // One outstanding request per session.
        if self.is_streaming() {
            self.emit_warning("a reply is already streaming; stop it first")
                .await;
            return None;
        }

        let user_turn = Turn::user(text);
        self.turns.push(user_turn.clone());
        self.persist_turn(&user_turn).await;

        let api_messages = self.api_messages();
        let cancel_token = CancellationToken::new();
        self.next_stream_id += 1;
        let stream_id = self.next_stream_id;
        self.phase = Phase::Streaming {
            stream_id,
            cancel_token: cancel_token.clone(),
            pending: Turn::pending_assistant(),
        };
        self.emit(ChatEvent::TurnStarted {
            session_id: self.session.id,
        })
        .await;

        Some(ChatCommand::SpawnStream(StreamParams {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_messages,
            options: self.options,
            cancel_token,
            stream_id,
        }))
    }

    /// Cooperative cancellation: signal the worker, then finalize whatever
    /// text has arrived so far. Stop while idle is a no-op.
    async fn stop(&mut self) {
        match &self.phase {
            Phase::Streaming { cancel_token, .. } => cancel_token.cancel(),
            Phase::Idle => return,
        }
        self.finalize_pending(TurnStatus::Cancelled).await;
    }

    async fn handle_stream_failure(&mut self, error: StreamError) {
        let had_output =
            matches!(&self.phase, Phase::Streaming { pending, .. } if !pending.content.is_empty());

        let message = match &error {
            StreamError::Connection(_) => {
                format!("{error}. Check that the runtime is up, then try again.")
            }
            StreamError::Timeout if had_output => {
                format!("{error}. Keeping the partial reply.")
            }
            _ => error.to_string(),
        };
        self.emit(ChatEvent::Error { message }).await;

        if had_output {
            self.finalize_pending(TurnStatus::Cancelled).await;
        } else {
            // Nothing arrived; the session keeps only the user turn.
            self.phase = Phase::Idle;
        }
    }

    async fn finalize_pending(&mut self, status: TurnStatus) {
        let Phase::Streaming { pending, .. } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return;
        };

        let mut turn = pending;
        turn.finalize(status);
        self.turns.push(turn.clone());
        self.persist_turn(&turn).await;
        self.emit(ChatEvent::TurnFinalized {
            session_id: self.session.id,
            turn,
        })
        .await;
    }

    async fn copy_last_reply(&mut self) {
        let last_reply = self
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role.is_assistant() && !turn.content.is_empty());

        match last_reply {
            Some(turn) => {
                let text = turn.content.clone();
                self.emit(ChatEvent::CopyText { text }).await;
            }
            None => self.emit_warning("no reply to copy yet").await,
        }
    }

    async fn new_session(&mut self) {
        if self.is_streaming() {
            self.emit_warning("stop the streaming reply before switching sessions")
                .await;
            return;
        }

        match self.store.create_session().await {
            Ok(session) => {
                self.session = session.clone();
                self.turns.clear();
                self.emit(ChatEvent::SessionOpened {
                    session,
                    turns: Vec::new(),
                })
                .await;
            }
            Err(e) => self.emit_storage_warning(&e).await,
        }
    }

    async fn open_session(&mut self, session_id: i64) {
        if self.is_streaming() {
            self.emit_warning("stop the streaming reply before switching sessions")
                .await;
            return;
        }

        let session = match self.store.session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.emit_warning(&format!("no session #{session_id}")).await;
                return;
            }
            Err(e) => {
                self.emit_storage_warning(&e).await;
                return;
            }
        };

        match self.store.list_turns(session_id).await {
            Ok(turns) => {
                self.session = session.clone();
                self.turns = turns.clone();
                self.emit(ChatEvent::SessionOpened { session, turns }).await;
            }
            Err(e) => self.emit_storage_warning(&e).await,
        }
    }

    async fn rename_session(&mut self, session_id: i64, title: String) {
        match self.store.rename_session(session_id, &title).await {
            Ok(true) => {
                if session_id == self.session.id {
                    self.session.title = title.clone();
                }
                self.emit(ChatEvent::SessionRenamed { session_id, title })
                    .await;
            }
            Ok(false) => self.emit_warning(&format!("no session #{session_id}")).await,
            Err(e) => self.emit_storage_warning(&e).await,
        }
    }

    /// Deleting the session that owns the in-flight stream is refused; the
    /// stream has to be stopped first. Deleting the open (idle) session
    /// replaces it with a fresh one.
    async fn delete_session(&mut self, session_id: i64) {
        if self.is_streaming() && session_id == self.session.id {
            self.emit_warning("stop the streaming reply before deleting this session")
                .await;
            return;
        }

        match self.store.delete_session(session_id).await {
            Ok(true) => {
                self.emit(ChatEvent::SessionDeleted { session_id }).await;
                if session_id == self.session.id {
                    self.new_session().await;
                }
            }
            Ok(false) => self.emit_warning(&format!("no session #{session_id}")).await,
            Err(e) => self.emit_storage_warning(&e).await,
        }
    }

    async fn list_sessions(&mut self) {
        match self.store.list_sessions(SESSION_LIST_LIMIT).await {
            Ok(sessions) => self.emit(ChatEvent::SessionList { sessions }).await,
            Err(e) => self.emit_storage_warning(&e).await,
        }
    }

    /// Context sent to the runtime: every prior turn that carries text,
    /// including the partial text of cancelled replies.
    fn api_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .filter(|turn| !turn.content.is_empty())
            .map(|turn| ChatMessage {
                role: turn.role.as_str().to_string(),
                content: turn.content.clone(),
            })
            .collect()
    }

    /// Storage failures while chatting are non-fatal: the in-memory
    /// transcript stays authoritative and the surface gets a warning.
    async fn persist_turn(&self, turn: &Turn) {
        if let Err(e) = self.store.append_turn(self.session.id, turn).await {
            tracing::warn!("failed to persist turn: {e}");
            self.emit(ChatEvent::Warning {
                message: format!("history not saved: {e}"),
            })
            .await;
        }
    }

    async fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event).await;
    }

    async fn emit_warning(&self, message: &str) {
        self.emit(ChatEvent::Warning {
            message: message.to_string(),
        })
        .await;
    }

    async fn emit_storage_warning(&self, error: &StorageError) {
        tracing::warn!("storage operation failed: {error}");
        self.emit(ChatEvent::Warning {
            message: error.to_string(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;

    async fn test_controller() -> (ChatController, mpsc::Receiver<ChatEvent>, SessionStore) {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (events_tx, events_rx) = mpsc::channel(64);
        let controller = ChatController::new(
            ControllerParams {
                store: store.clone(),
                client: reqwest::Client::new(),
                base_url: "http://localhost:11434".to_string(),
                model: "test-model".to_string(),
                options: None,
            },
            events_tx,
        )
        .await
        .unwrap();
        (controller, events_rx, store)
    }

    fn spawned_stream_id(command: Option<ChatCommand>) -> u64 {
        match command {
            Some(ChatCommand::SpawnStream(params)) => params.stream_id,
            None => panic!("expected spawn stream command"),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn completed_stream_persists_the_full_reply() {
        let (mut controller, mut rx, store) = test_controller().await;
        let session_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Hello".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(StreamMessage::Chunk("Hi".into()), stream_id)
            .await;
        controller
            .handle_stream_message(StreamMessage::Chunk(" there".into()), stream_id)
            .await;
        controller
            .handle_stream_message(StreamMessage::End, stream_id)
            .await;

        let turns = store.list_turns(session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].content, "Hi there");
        assert_eq!(turns[1].status, TurnStatus::Complete);

        let fragments: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ChatEvent::Fragment { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, ["Hi", " there"]);
    }

    #[tokio::test]
    async fn stop_mid_stream_persists_the_partial_as_cancelled() {
        let (mut controller, _rx, store) = test_controller().await;
        let session_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Explain X".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(StreamMessage::Chunk("Expl".into()), stream_id)
            .await;
        controller.apply(ChatAction::Stop).await;

        let turns = store.list_turns(session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "Expl");
        assert_eq!(turns[1].status, TurnStatus::Cancelled);

        // Back to idle: a new submit starts a new stream.
        assert!(controller
            .apply(ChatAction::Submit {
                text: "again".into()
            })
            .await
            .is_some());
    }

    #[tokio::test]
    async fn unreachable_endpoint_leaves_only_the_user_turn() {
        let (mut controller, mut rx, store) = test_controller().await;
        let session_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Hello".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(
                StreamMessage::Failed(StreamError::Connection("connection refused".into())),
                stream_id,
            )
            .await;
        // The worker always follows a failure with an end marker; by then
        // the stream is no longer current and the marker is dropped.
        controller
            .handle_stream_message(StreamMessage::End, stream_id)
            .await;

        let turns = store.list_turns(session_id).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);

        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ChatEvent::Error { message } if message.contains("try again"))));

        assert!(controller
            .apply(ChatAction::Submit {
                text: "retry".into()
            })
            .await
            .is_some());
    }

    #[tokio::test]
    async fn timeout_after_output_keeps_the_partial_text() {
        let (mut controller, _rx, store) = test_controller().await;
        let session_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "slow".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(StreamMessage::Chunk("partial".into()), stream_id)
            .await;
        controller
            .handle_stream_message(StreamMessage::Failed(StreamError::Timeout), stream_id)
            .await;

        let turns = store.list_turns(session_id).await.unwrap();
        assert_eq!(turns[1].content, "partial");
        assert_eq!(turns[1].status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn a_second_submit_while_streaming_is_refused() {
        let (mut controller, mut rx, _store) = test_controller().await;

        assert!(controller
            .apply(ChatAction::Submit {
                text: "first".into()
            })
            .await
            .is_some());
        assert!(controller
            .apply(ChatAction::Submit {
                text: "second".into()
            })
            .await
            .is_none());

        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ChatEvent::Warning { .. })));
    }

    #[tokio::test]
    async fn stale_stream_messages_are_discarded() {
        let (mut controller, mut rx, store) = test_controller().await;
        let session_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Hello".into(),
                })
                .await,
        );
        controller.apply(ChatAction::Stop).await;
        drain(&mut rx);

        controller
            .handle_stream_message(StreamMessage::Chunk("late".into()), stream_id)
            .await;

        let turns = store.list_turns(session_id).await.unwrap();
        assert_eq!(turns[1].content, "");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn deleting_the_streaming_session_is_refused() {
        let (mut controller, mut rx, store) = test_controller().await;
        let session_id = controller.session().id;

        controller
            .apply(ChatAction::Submit {
                text: "Hello".into(),
            })
            .await;
        controller
            .apply(ChatAction::DeleteSession { session_id })
            .await;

        assert!(store.session(session_id).await.unwrap().is_some());
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ChatEvent::Warning { message } if message.contains("stop"))));
    }

    #[tokio::test]
    async fn deleting_the_open_idle_session_replaces_it() {
        let (mut controller, mut rx, store) = test_controller().await;
        let old_id = controller.session().id;

        controller
            .apply(ChatAction::DeleteSession { session_id: old_id })
            .await;

        assert!(store.session(old_id).await.unwrap().is_none());
        assert_ne!(controller.session().id, old_id);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, ChatEvent::SessionDeleted { session_id } if *session_id == old_id)));
        assert!(events
            .iter()
            .any(|event| matches!(event, ChatEvent::SessionOpened { turns, .. } if turns.is_empty())));
    }

    #[tokio::test]
    async fn reopening_a_session_restores_its_transcript() {
        let (mut controller, mut rx, _store) = test_controller().await;
        let first_id = controller.session().id;

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Hello".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(StreamMessage::Chunk("Hi".into()), stream_id)
            .await;
        controller
            .handle_stream_message(StreamMessage::End, stream_id)
            .await;

        controller.apply(ChatAction::NewSession).await;
        assert_ne!(controller.session().id, first_id);

        drain(&mut rx);
        controller
            .apply(ChatAction::OpenSession {
                session_id: first_id,
            })
            .await;

        let opened = drain(&mut rx).into_iter().find_map(|event| match event {
            ChatEvent::SessionOpened { session, turns } => Some((session, turns)),
            _ => None,
        });
        let (session, turns) = opened.expect("expected session opened event");
        assert_eq!(session.id, first_id);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "Hi");
    }

    #[tokio::test]
    async fn copy_surfaces_the_last_nonempty_reply() {
        let (mut controller, mut rx, _store) = test_controller().await;

        controller.apply(ChatAction::CopyLastReply).await;
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ChatEvent::Warning { .. })));

        let stream_id = spawned_stream_id(
            controller
                .apply(ChatAction::Submit {
                    text: "Hello".into(),
                })
                .await,
        );
        controller
            .handle_stream_message(StreamMessage::Chunk("Hi there".into()), stream_id)
            .await;
        controller
            .handle_stream_message(StreamMessage::End, stream_id)
            .await;
        drain(&mut rx);

        controller.apply(ChatAction::CopyLastReply).await;
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ChatEvent::CopyText { text } if text == "Hi there")));
    }
}
