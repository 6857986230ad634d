//! Inbound connection: transport, reader task and the client handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthCoordinator, Credentials},
    bus::{EslEventStream, EventBus, EventFilter, SubscriptionHandle},
    command::{CommandOutcome, EslCommand},
    constants::{
        DEFAULT_AUTH_TIMEOUT_MS, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
        HEADER_CONTENT_DISPOSITION, LIVENESS_POLL_MS, SOCKET_BUF_SIZE,
    },
    error::{EslError, EslResult},
    event::{EslEventType, EventFormat},
    jobs::JobRegistry,
    protocol::{ContentType, EslMessage, EslParser},
    stream::{DisconnectReason, MessageStream},
};

fn event_types_to_string(events: &[EslEventType]) -> String {
    events
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Connection status for ESL client
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// ESL session is active.
    Connected,
    /// ESL session ended.
    Disconnected(DisconnectReason),
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit: Duration) -> EslResult<TcpStream> {
    let address = format!("{}:{}", host, port);
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(EslError::ConnectFailed {
                address,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                limit.as_millis()
            );
            Err(EslError::ConnectFailed {
                address,
                reason: format!("timed out after {}ms", limit.as_millis()),
            })
        }
    }
}

/// Shared state between EslClient and the reader task
struct SharedState {
    /// Liveness timeout in milliseconds (0 = disabled)
    liveness_timeout_ms: AtomicU64,
    /// Command response timeout in milliseconds
    command_timeout_ms: AtomicU64,
}

/// Options for ESL connection configuration.
///
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct EslConnectOptions {
    /// TCP connect deadline. Default: 2 seconds.
    pub connect_timeout: Duration,
    /// Deadline for each handshake step (challenge, then reply). Default: 2 seconds.
    pub auth_timeout: Duration,
    /// Deadline for each command reply. Default: 5 seconds.
    pub command_timeout: Duration,
    /// Disconnect after this long without inbound traffic. Zero disables. Default: disabled.
    pub liveness_timeout: Duration,
}

impl Default for EslConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            liveness_timeout: Duration::ZERO,
        }
    }
}

/// ESL client handle (Clone + Send)
///
/// Commands are serialized through the writer mutex. One reader task
/// publishes every inbound message into a [`MessageStream`]; replies, job
/// results and events are picked out of it by whoever is waiting.
#[derive(Clone)]
pub struct EslClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    pub(crate) stream: MessageStream,
    pub(crate) jobs: Arc<JobRegistry>,
    pub(crate) bus: EventBus,
}

impl std::fmt::Debug for EslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslClient")
            .field("connected", &self.is_connected())
            .field("pending_jobs", &self.jobs.pending_count())
            .finish()
    }
}

/// Background reader loop
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: EslParser,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    stream: MessageStream,
) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(reader, parser, shared, &stream));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };

    stream.close(reason.clone());
    // disconnect() may have closed the stream first; report that reason.
    let reason = stream
        .closed_reason()
        .unwrap_or(reason);
    let _ = status_tx.send(ConnectionStatus::Disconnected(reason));
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: EslParser,
    shared: Arc<SharedState>,
    stream: &MessageStream,
) -> DisconnectReason {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];
    let mut last_recv = Instant::now();

    loop {
        // Drain complete messages before touching the socket
        match parser.parse_message() {
            Ok(Some(message)) => {
                if *message.content_type() == ContentType::DisconnectNotice {
                    if message.header(HEADER_CONTENT_DISPOSITION) == Some("linger") {
                        debug!("Received disconnect notice with linger disposition, ignoring");
                        stream.publish(message);
                        continue;
                    }
                    info!("Received disconnect notice from server");
                    stream.publish(message);
                    return DisconnectReason::ServerNotice;
                }

                trace!(
                    "[RECV] Parsed {} (event: {:?})",
                    message.content_type(),
                    message.event_type()
                );
                if !stream.publish(message) {
                    debug!("Message stream closed, reader exiting");
                    return stream
                        .closed_reason()
                        .unwrap_or(DisconnectReason::ClientRequested);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Parser error: {}", e);
                return DisconnectReason::ParseError(e.to_string());
            }
        }

        let read_result = timeout(
            Duration::from_millis(LIVENESS_POLL_MS),
            reader.read(&mut read_buffer),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                info!("Connection closed (EOF)");
                return DisconnectReason::ConnectionClosed;
            }
            Ok(Ok(n)) => {
                trace!("[RECV] Read {} bytes from socket", n);
                last_recv = Instant::now();
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    return DisconnectReason::ParseError(e.to_string());
                }
            }
            Ok(Err(e)) => {
                warn!("Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
            Err(_) => {
                if let Some(reason) = stream.closed_reason() {
                    debug!("Message stream closed while idle, reader exiting");
                    return reason;
                }
                let threshold_ms = shared
                    .liveness_timeout_ms
                    .load(Ordering::Relaxed);
                if threshold_ms > 0 {
                    let elapsed = last_recv.elapsed();
                    if elapsed > Duration::from_millis(threshold_ms) {
                        warn!(
                            "Liveness timeout: {}ms without traffic (threshold {}ms)",
                            elapsed.as_millis(),
                            threshold_ms
                        );
                        return DisconnectReason::HeartbeatExpired;
                    }
                }
            }
        }
    }
}

impl EslClient {
    /// Connect to FreeSWITCH with password authentication
    ///
    /// ```rust,no_run
    /// # async fn example() -> Result<(), freeswitch_esl_inbound::EslError> {
    /// use freeswitch_esl_inbound::EslClient;
    ///
    /// let client = EslClient::connect("127.0.0.1", 8021, "ClueCon").await?;
    /// let status = client.api("status").await?;
    /// println!("{}", status.body().unwrap_or(""));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(host: &str, port: u16, password: &str) -> EslResult<Self> {
        Self::connect_with_options(
            host,
            port,
            Credentials::password(password),
            EslConnectOptions::default(),
        )
        .await
    }

    /// Connect with user authentication
    ///
    /// The user must be in the format `user@domain` (e.g., `admin@default`).
    pub async fn connect_with_user(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> EslResult<Self> {
        Self::connect_with_options(
            host,
            port,
            Credentials::user(user, password),
            EslConnectOptions::default(),
        )
        .await
    }

    /// Connect with explicit credentials and options.
    ///
    /// Fails with [`EslError::ConnectFailed`] if the socket cannot be opened
    /// and [`EslError::AuthFailed`] if the handshake does not succeed; in the
    /// latter case the socket is shut down before returning.
    pub async fn connect_with_options(
        host: &str,
        port: u16,
        credentials: Credentials,
        options: EslConnectOptions,
    ) -> EslResult<Self> {
        credentials.validate()?;

        info!("Connecting to FreeSWITCH at {}:{}", host, port);
        let tcp = tcp_connect_with_timeout(host, port, options.connect_timeout).await?;
        let (read_half, mut write_half) = tcp.into_split();

        let stream = MessageStream::new();
        // Both registrations must exist before the reader publishes anything.
        let auth = AuthCoordinator::new(&stream, credentials, options.auth_timeout);
        let jobs = JobRegistry::attach(&stream);

        let shared = Arc::new(SharedState {
            liveness_timeout_ms: AtomicU64::new(
                options
                    .liveness_timeout
                    .as_millis() as u64,
            ),
            command_timeout_ms: AtomicU64::new(
                options
                    .command_timeout
                    .as_millis() as u64,
            ),
        });
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let reader = tokio::spawn(reader_loop(
            read_half,
            EslParser::new(),
            shared.clone(),
            status_tx,
            stream.clone(),
        ));

        if let Err(e) = auth
            .run(&stream, &mut write_half)
            .await
        {
            reader.abort();
            stream.close(DisconnectReason::ClientRequested);
            let _ = write_half
                .shutdown()
                .await;
            return Err(e);
        }

        info!("Successfully connected and authenticated to FreeSWITCH");
        Ok(EslClient {
            writer: Arc::new(Mutex::new(write_half)),
            shared,
            status_rx,
            bus: EventBus::new(stream.clone()),
            stream,
            jobs,
        })
    }

    /// Send a command and wait for its reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle; ESL
    /// replies carry no correlation id and arrive in command order. The reply
    /// wait is registered before the command is written.
    pub async fn send_command(&self, command: EslCommand) -> EslResult<Arc<EslMessage>> {
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }

        let command_str = command.to_wire_format()?;
        match &command {
            EslCommand::Auth { .. } => debug!("Sending command: auth [REDACTED]"),
            EslCommand::UserAuth { user, .. } => {
                debug!("Sending command: userauth {}:[REDACTED]", user)
            }
            _ => debug!("Sending command: {}", command_str.trim()),
        }

        let mut writer = self
            .writer
            .lock()
            .await;

        let reply_type = if command.expects_api_response() {
            ContentType::ApiResponse
        } else {
            ContentType::CommandReply
        };
        let reply = self
            .stream
            .next_matching(move |message| *message.content_type() == reply_type);

        writer
            .write_all(command_str.as_bytes())
            .await
            .map_err(EslError::Io)?;

        let timeout_ms = self
            .shared
            .command_timeout_ms
            .load(Ordering::Relaxed);
        let message = reply
            .wait(Duration::from_millis(timeout_ms))
            .await;
        drop(writer);

        let message = message?;
        debug!(
            "Received response: success={}",
            message
                .outcome()
                .is_success()
        );
        Ok(message)
    }

    /// Send a command and require a successful reply.
    async fn send_command_ok(&self, command: EslCommand) -> EslResult<CommandOutcome> {
        self.send_command(command)
            .await?
            .outcome()
            .into_result()
    }

    /// Execute API command. Blocks until FreeSWITCH completes the command.
    ///
    /// FreeSWITCH blocks the ESL socket during `api`; no events are delivered
    /// until it returns. Use [`bgapi`](Self::bgapi) for long-running commands.
    pub async fn api(&self, command: &str) -> EslResult<Arc<EslMessage>> {
        let cmd = EslCommand::Api {
            command: command.to_string(),
        };
        self.send_command(cmd)
            .await
    }

    /// Start a background job and return its job id.
    ///
    /// The id is generated here and sent as `Job-UUID`, so it is tracked
    /// before the server can report on it. Collect the result with
    /// [`await_job`](Self::await_job).
    ///
    /// Results arrive as `BACKGROUND_JOB` events, so the connection must be
    /// subscribed to them with [`subscribe_events`](Self::subscribe_events);
    /// without that every `await_job` runs into its timeout.
    pub async fn issue_background_command(&self, command: &str) -> EslResult<String> {
        let job_id = Uuid::new_v4().to_string();
        self.jobs
            .track(&job_id);

        let cmd = EslCommand::BgApi {
            command: command.to_string(),
            job_uuid: Some(job_id.clone()),
        };
        let reply = match self
            .send_command(cmd)
            .await
            .and_then(|reply| {
                reply
                    .outcome()
                    .into_result()
                    .map(|_| reply)
            }) {
            Ok(reply) => reply,
            Err(e) => {
                self.jobs
                    .forget(&job_id);
                return Err(e);
            }
        };

        match reply.job_uuid() {
            Some(echoed) if echoed != job_id => {
                warn!("Server assigned job id {} instead of {}", echoed, job_id);
                self.jobs
                    .rekey(&job_id, echoed);
                Ok(echoed.to_string())
            }
            _ => {
                debug!("Background job {} started: {}", job_id, command);
                Ok(job_id)
            }
        }
    }

    /// Wait up to `limit` for the result of a background job.
    ///
    /// Results that arrived before this call are returned immediately, and so
    /// is a result that was already collected for the same id. Needs a
    /// `BACKGROUND_JOB` subscription.
    pub async fn await_job(&self, job_id: &str, limit: Duration) -> EslResult<CommandOutcome> {
        self.jobs
            .await_job(job_id, limit)
            .await
    }

    /// Run a background job and wait up to `limit` for its result.
    ///
    /// ```rust,no_run
    /// # async fn example(client: &freeswitch_esl_inbound::EslClient) -> Result<(), freeswitch_esl_inbound::EslError> {
    /// use std::time::Duration;
    ///
    /// let outcome = client.bgapi("status", Duration::from_secs(10)).await?;
    /// println!("{}", outcome.text());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bgapi(&self, command: &str, limit: Duration) -> EslResult<CommandOutcome> {
        let job_id = self
            .issue_background_command(command)
            .await?;
        self.await_job(&job_id, limit)
            .await
    }

    /// Call `handler` for every `event_type` event of `call_id` until the
    /// handle is disposed or the connection ends.
    ///
    /// Events only arrive for types the connection is subscribed to with
    /// [`subscribe_events`](Self::subscribe_events).
    pub fn on<F>(&self, call_id: &str, event_type: EslEventType, handler: F) -> SubscriptionHandle
    where
        F: FnMut(Arc<EslMessage>) + Send + 'static,
    {
        self.subscribe(
            EventFilter::call(call_id).with_event_type(event_type),
            handler,
        )
    }

    /// Call `handler` for every event matching `filter`.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionHandle
    where
        F: FnMut(Arc<EslMessage>) + Send + 'static,
    {
        self.bus
            .subscribe(filter, handler)
    }

    /// Wait up to `limit` for the next event matching `filter`.
    pub async fn await_next_event(
        &self,
        filter: EventFilter,
        limit: Duration,
    ) -> EslResult<Arc<EslMessage>> {
        self.bus
            .first_matching(filter, limit)
            .await
    }

    /// Wait up to `limit` for the next inbound message of any kind matching
    /// `predicate`. Only messages that arrive after this call are considered.
    pub async fn await_next<F>(&self, predicate: F, limit: Duration) -> EslResult<Arc<EslMessage>>
    where
        F: Fn(&EslMessage) -> bool + Send + Sync + 'static,
    {
        self.stream
            .await_next(predicate, limit)
            .await
    }

    /// Every event from now on.
    pub fn events(&self) -> EslEventStream {
        self.events_matching(EventFilter::any())
    }

    /// Every event matching `filter` from now on.
    pub fn events_matching(&self, filter: EventFilter) -> EslEventStream {
        self.bus
            .stream(filter)
    }

    /// Subscribe to events by typed enum variants.
    ///
    /// For `CUSTOM` event subclasses (e.g., `sofia::register`), use
    /// [`subscribe_events_raw`](Self::subscribe_events_raw) instead.
    pub async fn subscribe_events(
        &self,
        format: EventFormat,
        events: &[EslEventType],
    ) -> EslResult<()> {
        let events_str = if events.contains(&EslEventType::All) {
            "ALL".to_string()
        } else {
            event_types_to_string(events)
        };

        let cmd = EslCommand::Events {
            format: format.to_string(),
            events: events_str,
        };

        self.send_command_ok(cmd)
            .await?;
        info!("Subscribed to events with format {:?}", format);
        Ok(())
    }

    /// Subscribe to events using raw event name strings.
    pub async fn subscribe_events_raw(&self, format: EventFormat, events: &str) -> EslResult<()> {
        let cmd = EslCommand::Events {
            format: format.to_string(),
            events: events.to_string(),
        };

        self.send_command_ok(cmd)
            .await?;
        info!(
            "Subscribed to raw events '{}' with format {:?}",
            events, format
        );
        Ok(())
    }

    /// Ask the server to only send events whose `header` equals `value`.
    pub async fn filter_events(&self, header: &str, value: &str) -> EslResult<()> {
        let cmd = EslCommand::Filter {
            header: header.to_string(),
            value: value.to_string(),
        };

        self.send_command_ok(cmd)
            .await?;
        debug!("Set event filter: {} = {}", header, value);
        Ok(())
    }

    /// Remove a server-side event filter. `header` `all` removes every filter.
    pub async fn filter_delete(&self, header: &str, value: Option<&str>) -> EslResult<()> {
        let cmd = EslCommand::FilterDelete {
            header: header.to_string(),
            value: value.map(|v| v.to_string()),
        };
        self.send_command_ok(cmd)
            .await
            .map(|_| ())
    }

    /// Unsubscribe from specific events.
    pub async fn nixevent(&self, events: &[EslEventType]) -> EslResult<()> {
        let cmd = EslCommand::NixEvent {
            events: event_types_to_string(events),
        };
        self.send_command_ok(cmd)
            .await
            .map(|_| ())
    }

    /// Unsubscribe from all events.
    pub async fn noevents(&self) -> EslResult<()> {
        self.send_command_ok(EslCommand::NoEvents)
            .await
            .map(|_| ())
    }

    /// Send a no-op command (keepalive).
    pub async fn noop(&self) -> EslResult<CommandOutcome> {
        self.send_command(EslCommand::NoOp)
            .await
            .map(|reply| reply.outcome())
    }

    /// Send `exit` and wait for the server's reply; the server then closes
    /// the connection.
    pub async fn exit(&self) -> EslResult<CommandOutcome> {
        self.send_command(EslCommand::Exit)
            .await
            .map(|reply| reply.outcome())
    }

    /// Set liveness timeout. Any inbound TCP traffic resets the timer.
    /// Set to zero to disable (default).
    pub fn set_liveness_timeout(&self, duration: Duration) {
        self.shared
            .liveness_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set command response timeout (default: 5 seconds).
    ///
    /// If increased for long-running `api()` calls, also increase or disable
    /// the liveness timeout; `api` blocks the socket, starving the liveness timer.
    pub fn set_command_timeout(&self, duration: Duration) {
        self.shared
            .command_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of background jobs still waiting for their result.
    pub fn pending_jobs(&self) -> usize {
        self.jobs
            .pending_count()
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        match self
            .stream
            .closed_reason()
        {
            Some(reason) => ConnectionStatus::Disconnected(reason),
            None => self
                .status_rx
                .borrow()
                .clone(),
        }
    }

    /// Resolve once the reader task has stopped, with the reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut status_rx = self
            .status_rx
            .clone();
        loop {
            let current = status_rx
                .borrow_and_update()
                .clone();
            if let ConnectionStatus::Disconnected(reason) = current {
                return reason;
            }
            if status_rx
                .changed()
                .await
                .is_err()
            {
                return self
                    .stream
                    .closed_reason()
                    .unwrap_or(DisconnectReason::ConnectionClosed);
            }
        }
    }

    /// End the session: fail every pending wait with
    /// [`DisconnectReason::ClientRequested`] and shut down the write half.
    pub async fn disconnect(&self) -> EslResult<()> {
        info!("Client requested disconnect");
        self.stream
            .close(DisconnectReason::ClientRequested);
        let mut writer = self
            .writer
            .lock()
            .await;
        writer
            .shutdown()
            .await
            .map_err(EslError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_eq() {
        assert_eq!(ConnectionStatus::Connected, ConnectionStatus::Connected);
        assert_eq!(
            ConnectionStatus::Disconnected(DisconnectReason::ServerNotice),
            ConnectionStatus::Disconnected(DisconnectReason::ServerNotice)
        );
        assert_ne!(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected(DisconnectReason::ConnectionClosed)
        );
    }

    #[test]
    fn test_default_options() {
        let options = EslConnectOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(2));
        assert_eq!(options.auth_timeout, Duration::from_secs(2));
        assert_eq!(options.command_timeout, Duration::from_secs(5));
        assert!(options
            .liveness_timeout
            .is_zero());
    }

    #[test]
    fn test_event_types_to_string() {
        assert_eq!(
            event_types_to_string(&[EslEventType::ChannelAnswer, EslEventType::BackgroundJob]),
            "CHANNEL_ANSWER BACKGROUND_JOB"
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let port = listener
            .local_addr()
            .unwrap()
            .port();
        drop(listener);

        let err = EslClient::connect("127.0.0.1", port, "ClueCon")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_user_rejected_before_connecting() {
        let err = EslClient::connect_with_user("127.0.0.1", 1, "admin", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::AuthFailed { .. }));
    }
}
