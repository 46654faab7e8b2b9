//! Interactive terminal front-end.
//!
//! Deliberately line-oriented: the surface reads one action per input line,
//! renders streamed fragments to stdout as they arrive, and leaves all
//! conversation state to the controller. Slash commands cover the session
//! controls; anything else is submitted as a chat message.

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::api::GenerationOptions;
use crate::core::chat_stream::ChatStreamService;
use crate::core::constants::EVENT_QUEUE_CAPACITY;
use crate::core::controller::{
    ChatAction, ChatCommand, ChatController, ChatEvent, ControllerParams,
};
use crate::core::message::TurnStatus;
use crate::store::{SessionMeta, SessionStore};
use crate::utils::clipboard::copy_to_clipboard;

pub struct ChatSetup {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub options: Option<GenerationOptions>,
    pub store: SessionStore,
}

#[derive(Debug, PartialEq)]
enum Input {
    Action(ChatAction),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub async fn run_chat(setup: ChatSetup) -> Result<(), Box<dyn Error>> {
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (stream_service, mut stream_rx) = ChatStreamService::new();

    let mut controller = ChatController::new(
        ControllerParams {
            store: setup.store,
            client: setup.client,
            base_url: setup.base_url.clone(),
            model: setup.model,
            options: setup.options,
        },
        events_tx,
    )
    .await?;

    let mut view = SurfaceView::new();
    println!(
        "brazier: chatting with {} via {}",
        controller.model(),
        setup.base_url
    );
    println!("Type a message and press Enter. /help lists commands.");
    view.prompt()?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Help => print_help(),
                    Input::Unknown(message) => println!("! {message}"),
                    Input::Action(action) => {
                        if let Some(command) = controller.apply(action).await {
                            match command {
                                ChatCommand::SpawnStream(params) => {
                                    stream_service.spawn_stream(params);
                                }
                            }
                        }
                    }
                }
                view.render_pending(&mut events_rx)?;
                if !view.streaming {
                    view.prompt()?;
                }
            }
            Some((message, stream_id)) = stream_rx.recv() => {
                controller.handle_stream_message(message, stream_id).await;
                view.render_pending(&mut events_rx)?;
            }
        }
    }

    Ok(())
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Input::Action(ChatAction::Submit {
            text: line.to_string(),
        });
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    let argument = parts.next().map(str::trim).unwrap_or("");

    match command {
        "stop" => Input::Action(ChatAction::Stop),
        "copy" => Input::Action(ChatAction::CopyLastReply),
        "new" => Input::Action(ChatAction::NewSession),
        "sessions" => Input::Action(ChatAction::ListSessions),
        "open" => match argument.parse() {
            Ok(session_id) => Input::Action(ChatAction::OpenSession { session_id }),
            Err(_) => Input::Unknown("usage: /open <session-id>".to_string()),
        },
        "delete" => match argument.parse() {
            Ok(session_id) => Input::Action(ChatAction::DeleteSession { session_id }),
            Err(_) => Input::Unknown("usage: /delete <session-id>".to_string()),
        },
        "rename" => {
            let mut pieces = argument.splitn(2, char::is_whitespace);
            let id = pieces.next().unwrap_or("").parse();
            let title = pieces.next().map(str::trim).unwrap_or("");
            match (id, title.is_empty()) {
                (Ok(session_id), false) => Input::Action(ChatAction::RenameSession {
                    session_id,
                    title: title.to_string(),
                }),
                _ => Input::Unknown("usage: /rename <session-id> <title>".to_string()),
            }
        }
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(format!("unknown command /{other} (try /help)")),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /stop                  stop the streaming reply");
    println!("  /copy                  copy the last reply to the clipboard");
    println!("  /new                   start a new session");
    println!("  /sessions              list stored sessions");
    println!("  /open <id>             switch to a stored session");
    println!("  /rename <id> <title>   rename a session");
    println!("  /delete <id>           delete a session");
    println!("  /quit                  leave");
}

struct SurfaceView {
    streaming: bool,
}

impl SurfaceView {
    fn new() -> Self {
        Self { streaming: false }
    }

    fn prompt(&self) -> io::Result<()> {
        let mut out = io::stdout();
        write!(out, "you> ")?;
        out.flush()
    }

    fn render_pending(&mut self, events: &mut mpsc::Receiver<ChatEvent>) -> io::Result<()> {
        while let Ok(event) = events.try_recv() {
            self.render(event)?;
        }
        Ok(())
    }

    fn render(&mut self, event: ChatEvent) -> io::Result<()> {
        match event {
            ChatEvent::TurnStarted { .. } => {
                self.streaming = true;
            }
            ChatEvent::Fragment { text, .. } => {
                let mut out = io::stdout();
                write!(out, "{text}")?;
                out.flush()?;
            }
            ChatEvent::TurnFinalized { turn, .. } => {
                self.streaming = false;
                if turn.status == TurnStatus::Cancelled {
                    println!();
                    println!("[stopped]");
                } else {
                    println!();
                }
                self.prompt()?;
            }
            ChatEvent::SessionOpened { session, turns } => {
                println!("session #{} {}", session.id, title_or_placeholder(&session));
                for turn in &turns {
                    if turn.role.is_user() {
                        println!("you> {}", turn.content);
                    } else if !turn.content.is_empty() {
                        println!("{}", turn.content);
                    }
                }
            }
            ChatEvent::SessionRenamed { session_id, title } => {
                println!("session #{session_id} renamed to {title}");
            }
            ChatEvent::SessionDeleted { session_id } => {
                println!("session #{session_id} deleted");
            }
            ChatEvent::SessionList { sessions } => {
                if sessions.is_empty() {
                    println!("no stored sessions");
                }
                for session in &sessions {
                    println!(
                        "  #{:<4} {:<33} {}",
                        session.id,
                        title_or_placeholder(session),
                        session.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            ChatEvent::CopyText { text } => match copy_to_clipboard(&text) {
                Ok(()) => println!("copied {} characters", text.chars().count()),
                Err(e) => {
                    println!("! {e}");
                    println!("{text}");
                }
            },
            ChatEvent::Warning { message } => println!("! {message}"),
            ChatEvent::Error { message } => println!("❌ {message}"),
        }
        Ok(())
    }
}

fn title_or_placeholder(session: &SessionMeta) -> String {
    if session.title.is_empty() {
        "(untitled)".to_string()
    } else {
        session.title.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_text_becomes_a_submit_action() {
        match parse_input("  Hello there  ") {
            Input::Action(ChatAction::Submit { text }) => assert_eq!(text, "Hello there"),
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn slash_commands_map_to_actions() {
        assert_eq!(parse_input("/stop"), Input::Action(ChatAction::Stop));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert!(matches!(
            parse_input("/open 7"),
            Input::Action(ChatAction::OpenSession { session_id: 7 })
        ));
        assert!(matches!(
            parse_input("/rename 3 Morning notes"),
            Input::Action(ChatAction::RenameSession { session_id: 3, ref title }) if title == "Morning notes"
        ));
    }

    #[test]
    fn malformed_commands_report_usage() {
        assert!(matches!(parse_input("/open seven"), Input::Unknown(_)));
        assert!(matches!(parse_input("/rename 3"), Input::Unknown(_)));
        assert!(matches!(parse_input("/bogus"), Input::Unknown(_)));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_input("   "), Input::Empty);
    }
}
