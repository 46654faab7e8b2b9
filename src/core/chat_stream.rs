use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;

use crate::api::{ChatMessage, ChatRequest, GenerationOptions};
use crate::core::constants::STALL_TIMEOUT;
use crate::utils::url::construct_api_url;

/// Ways a chat stream can fail before reaching its end-of-response marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// The runtime endpoint could not be reached.
    Connection(String),
    /// No fragment arrived within the stall window.
    Timeout,
    /// The runtime answered, but with an error payload.
    Api(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Connection(detail) => {
                write!(f, "cannot reach the model runtime: {detail}")
            }
            StreamError::Timeout => write!(f, "the model runtime stopped responding"),
            StreamError::Api(detail) => write!(f, "runtime error: {detail}"),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Chunk(String),
    Failed(StreamError),
    End,
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub options: Option<GenerationOptions>,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

/// Spawns chat requests against the runtime and feeds their fragments back
/// through a single channel, tagged with the stream id they belong to.
/// Fragments for a superseded stream are discarded by the receiver, not here.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
    stall_timeout: Duration,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                stall_timeout: STALL_TIMEOUT,
            },
            rx,
        )
    }

    pub fn spawn_stream(&self, params: StreamParams) {
        let tx_clone = self.tx.clone();
        let stall_timeout = self.stall_timeout;
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                model,
                api_messages,
                options,
                cancel_token,
                stream_id,
            } = params;

            let request = ChatRequest {
                model,
                messages: api_messages,
                stream: true,
                options,
            };

            tokio::select! {
                _ = run_stream(client, base_url, request, &tx_clone, stream_id, stall_timeout, &cancel_token) => {}
                _ = cancel_token.cancelled() => {}
            }
        });
    }
}

async fn run_stream(
    client: reqwest::Client,
    base_url: String,
    request: ChatRequest,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
    stall_timeout: Duration,
    cancel_token: &tokio_util::sync::CancellationToken,
) {
    let chat_url = construct_api_url(&base_url, "api/chat");
    let response = match client.post(chat_url).json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send((
                StreamMessage::Failed(StreamError::Connection(e.to_string())),
                stream_id,
            ));
            let _ = tx.send((StreamMessage::End, stream_id));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let _ = tx.send((
            StreamMessage::Failed(StreamError::Api(format!("{status}: {}", body.trim()))),
            stream_id,
        ));
        let _ = tx.send((StreamMessage::End, stream_id));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let next = match tokio::time::timeout(stall_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx.send((StreamMessage::Failed(StreamError::Timeout), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        };

        let Some(chunk) = next else { break };

        if cancel_token.is_cancelled() {
            return;
        }

        match chunk {
            Ok(chunk_bytes) => {
                buffer.extend_from_slice(&chunk_bytes);

                while let Some(newline_pos) = memchr(b'\n', &buffer) {
                    let line_str = match std::str::from_utf8(&buffer[..newline_pos]) {
                        Ok(s) => s.trim().to_string(),
                        Err(e) => {
                            tracing::debug!("invalid UTF-8 in stream: {e}");
                            buffer.drain(..=newline_pos);
                            continue;
                        }
                    };

                    let should_end = process_chunk_line(&line_str, tx, stream_id);
                    buffer.drain(..=newline_pos);
                    if should_end {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send((
                    StreamMessage::Failed(StreamError::Connection(e.to_string())),
                    stream_id,
                ));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        }
    }

    // Connection closed without a done marker; report what we have as done.
    let _ = tx.send((StreamMessage::End, stream_id));
}

/// Handle one newline-delimited JSON chunk. Returns true when the chunk
/// terminates the stream (done marker or runtime error).
fn process_chunk_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) -> bool {
    if line.is_empty() {
        return false;
    }

    match serde_json::from_str::<crate::api::ChatChunk>(line) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                let _ = tx.send((StreamMessage::Failed(StreamError::Api(error)), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return true;
            }

            if let Some(message) = chunk.message {
                if !message.content.is_empty() {
                    let _ = tx.send((StreamMessage::Chunk(message.content), stream_id));
                }
            }

            if chunk.done {
                let _ = tx.send((StreamMessage::End, stream_id));
                return true;
            }

            false
        }
        Err(e) => {
            tracing::debug!("unparseable stream line: {e} - data: {line}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_chunks_are_forwarded_in_order() {
        let (service, mut rx) = ChatStreamService::new();
        let stream_id = 7;

        assert!(!process_chunk_line(
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#,
            &service.tx,
            stream_id,
        ));
        assert!(!process_chunk_line(
            r#"{"message":{"role":"assistant","content":" world"},"done":false}"#,
            &service.tx,
            stream_id,
        ));

        for expected in ["Hello", " world"] {
            let (message, received_id) = rx.try_recv().expect("expected chunk message");
            assert_eq!(received_id, stream_id);
            match message {
                StreamMessage::Chunk(content) => assert_eq!(content, expected),
                other => panic!("expected chunk message, got {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn done_marker_terminates_the_stream() {
        let (service, mut rx) = ChatStreamService::new();
        let stream_id = 3;

        assert!(process_chunk_line(
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}"#,
            &service.tx,
            stream_id,
        ));

        let (message, received_id) = rx.try_recv().expect("expected end message");
        assert_eq!(received_id, stream_id);
        assert!(matches!(message, StreamMessage::End));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn final_chunk_may_carry_trailing_content() {
        let (service, mut rx) = ChatStreamService::new();

        assert!(process_chunk_line(
            r#"{"message":{"role":"assistant","content":"!"},"done":true}"#,
            &service.tx,
            1,
        ));

        let (message, _) = rx.try_recv().expect("expected chunk message");
        assert!(matches!(message, StreamMessage::Chunk(content) if content == "!"));
        let (message, _) = rx.try_recv().expect("expected end message");
        assert!(matches!(message, StreamMessage::End));
    }

    #[test]
    fn runtime_errors_are_routed_as_failures() {
        let (service, mut rx) = ChatStreamService::new();
        let stream_id = 99;

        assert!(process_chunk_line(
            r#"{"error":"model 'missing' not found"}"#,
            &service.tx,
            stream_id,
        ));

        let (message, received_id) = rx.try_recv().expect("expected failure message");
        assert_eq!(received_id, stream_id);
        match message {
            StreamMessage::Failed(StreamError::Api(detail)) => {
                assert_eq!(detail, "model 'missing' not found");
            }
            other => panic!("expected api failure, got {other:?}"),
        }

        let (message, _) = rx.try_recv().expect("expected end message");
        assert!(matches!(message, StreamMessage::End));
    }

    #[test]
    fn blank_and_garbage_lines_are_ignored() {
        let (service, mut rx) = ChatStreamService::new();

        assert!(!process_chunk_line("", &service.tx, 1));
        assert!(!process_chunk_line("not json", &service.tx, 1));
        assert!(rx.try_recv().is_err());
    }
}
