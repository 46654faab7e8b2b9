//! Shared constants used across the application

use std::time::Duration;

/// Default base URL for a locally running model runtime.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Time allowed for the initial connection to the runtime before the
/// request is reported as unreachable.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum gap between streamed fragments before the stream is treated
/// as stalled and aborted.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How many sessions a listing returns.
pub const SESSION_LIST_LIMIT: i64 = 50;

/// Maximum length, in characters, of a session title derived from the
/// first user message.
pub const TITLE_MAX_CHARS: usize = 30;

/// Capacity of the controller-to-surface event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 64;
