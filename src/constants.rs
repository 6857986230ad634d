//! Protocol constants and configuration defaults

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Socket read buffer size (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Parser buffer allocation step (64KB)
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message size (8MB), checked against Content-Length
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum unparsed data held by the parser (16MB)
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_TEXT_EVENT_XML: &str = "text/event-xml";
pub const CONTENT_TYPE_LOG_DATA: &str = "log/data";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header names.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Timeout for each step of the auth handshake in milliseconds
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 2000;

/// Command reply timeout in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Overall originate timeout in milliseconds
pub const DEFAULT_ORIGINATE_TIMEOUT_MS: u64 = 60_000;

/// How often the reader wakes up to check liveness when the socket is idle
pub const LIVENESS_POLL_MS: u64 = 2000;

/// Job results for ids nobody registered are kept this long (by count) so a
/// late `await_job` can still collect them.
pub const MAX_UNCLAIMED_JOB_RESULTS: usize = 256;

/// Tracked jobs kept before collected and abandoned entries are evicted,
/// oldest first. Jobs someone is still waiting on are never evicted.
pub const MAX_TRACKED_JOBS: usize = 1024;

/// Results already handed out are remembered this long (by count), so the
/// same id is answered again instead of being tracked anew.
pub const MAX_RETIRED_JOB_RESULTS: usize = 256;
