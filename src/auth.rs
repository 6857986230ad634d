//! One-time authentication handshake

use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    command::EslCommand,
    error::{EslError, EslResult},
    protocol::{ContentType, EslMessage},
    stream::{MessageStream, NextMessage},
};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthState {
    Connected,
    AwaitingChallenge,
    ChallengeReceived,
    AwaitingReply,
    Authenticated,
    Failed,
}

/// Credentials sent in reply to the server's `auth/request`.
#[derive(Clone)]
pub enum Credentials {
    /// `auth <password>`
    Password(String),
    /// `userauth <user>:<password>`, user in `user@domain` form
    User { user: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f
                .debug_tuple("Password")
                .field(&"[REDACTED]")
                .finish(),
            Credentials::User { user, .. } => f
                .debug_struct("User")
                .field("user", user)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Credentials::Password(password.into())
    }

    pub fn user(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::User {
            user: user.into(),
            password: password.into(),
        }
    }

    pub(crate) fn validate(&self) -> EslResult<()> {
        if let Credentials::User { user, .. } = self {
            if !user.contains('@') {
                return Err(EslError::auth_failed(format!(
                    "Invalid username format '{}': must be user@domain (e.g., admin@default)",
                    user
                )));
            }
        }
        Ok(())
    }

    fn command(&self) -> EslCommand {
        match self {
            Credentials::Password(password) => EslCommand::Auth {
                password: password.clone(),
            },
            Credentials::User { user, password } => EslCommand::UserAuth {
                user: user.clone(),
                password: password.clone(),
            },
        }
    }
}

fn is_challenge(message: &EslMessage) -> bool {
    *message.content_type() == ContentType::AuthRequest
}

fn is_command_reply(message: &EslMessage) -> bool {
    *message.content_type() == ContentType::CommandReply
}

/// Drives the handshake over a message stream and a write half.
///
/// The challenge wait is registered in [`new`](Self::new), so the coordinator
/// must be created before anything starts publishing into the stream.
pub(crate) struct AuthCoordinator {
    state: AuthState,
    credentials: Credentials,
    challenge: Option<NextMessage>,
    step_timeout: Duration,
}

impl AuthCoordinator {
    pub(crate) fn new(
        stream: &MessageStream,
        credentials: Credentials,
        step_timeout: Duration,
    ) -> Self {
        let mut coordinator = Self {
            state: AuthState::Connected,
            credentials,
            challenge: None,
            step_timeout,
        };
        coordinator.challenge = Some(stream.next_matching(is_challenge));
        coordinator.transition(AuthState::AwaitingChallenge);
        coordinator
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> AuthState {
        self.state
    }

    fn transition(&mut self, next: AuthState) {
        debug!("[AUTH] {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, reason: impl Into<String>) -> EslError {
        let reason = reason.into();
        warn!("[AUTH] Authentication failed: {}", reason);
        self.transition(AuthState::Failed);
        EslError::auth_failed(reason)
    }

    /// Run the handshake to completion. Every failure is reported as
    /// [`EslError::AuthFailed`]; nothing is retried.
    pub(crate) async fn run<W>(mut self, stream: &MessageStream, writer: &mut W) -> EslResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let step_ms = self
            .step_timeout
            .as_millis();

        let Some(challenge) = self
            .challenge
            .take()
        else {
            return Err(self.fail("handshake already consumed"));
        };
        match challenge
            .wait(self.step_timeout)
            .await
        {
            Ok(_) => self.transition(AuthState::ChallengeReceived),
            Err(EslError::Timeout { .. }) => {
                return Err(self.fail(format!("no auth/request within {}ms", step_ms)))
            }
            Err(e) => return Err(self.fail(format!("waiting for auth/request: {}", e))),
        }

        let command = self
            .credentials
            .command();
        let wire = match command.to_wire_format() {
            Ok(wire) => wire,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        let reply = stream.next_matching(is_command_reply);
        self.transition(AuthState::AwaitingReply);

        match &self.credentials {
            Credentials::Password(_) => debug!("Sending command: auth [REDACTED]"),
            Credentials::User { user, .. } => {
                debug!("Sending command: userauth {}:[REDACTED]", user)
            }
        }
        if let Err(e) = writer
            .write_all(wire.as_bytes())
            .await
        {
            return Err(self.fail(format!("sending credentials: {}", e)));
        }

        let message = match reply
            .wait(self.step_timeout)
            .await
        {
            Ok(message) => message,
            Err(EslError::Timeout { .. }) => {
                return Err(self.fail(format!("no auth reply within {}ms", step_ms)))
            }
            Err(e) => return Err(self.fail(format!("waiting for auth reply: {}", e))),
        };

        let outcome = message.outcome();
        if !outcome.is_success() {
            let text = if outcome
                .text()
                .is_empty()
            {
                "Authentication failed".to_string()
            } else {
                outcome
                    .text()
                    .to_string()
            };
            return Err(self.fail(text));
        }

        self.transition(AuthState::Authenticated);
        info!("[AUTH] Authentication successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DisconnectReason;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    fn message(content_type: ContentType, reply_text: Option<&str>) -> EslMessage {
        let mut headers = HashMap::new();
        if let Some(text) = reply_text {
            headers.insert("Reply-Text".to_string(), text.to_string());
        }
        EslMessage::new(content_type, headers, None)
    }

    async fn read_exact_string(reader: &mut tokio::io::DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let stream = MessageStream::new();
        let coordinator =
            AuthCoordinator::new(&stream, Credentials::password("ClueCon"), Duration::from_secs(1));
        assert_eq!(coordinator.state(), AuthState::AwaitingChallenge);

        // Challenge published before the handshake task runs is still seen.
        stream.publish(message(ContentType::AuthRequest, None));

        let (mut ours, mut server) = tokio::io::duplex(1024);
        let task_stream = stream.clone();
        let task = tokio::spawn(async move {
            coordinator
                .run(&task_stream, &mut ours)
                .await
        });

        let sent = read_exact_string(&mut server, "auth ClueCon\n\n".len()).await;
        assert_eq!(sent, "auth ClueCon\n\n");

        stream.publish(message(ContentType::CommandReply, Some("+OK accepted")));
        task.await
            .unwrap()
            .unwrap();
        assert_eq!(stream.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_userauth_command_sent() {
        let stream = MessageStream::new();
        let coordinator = AuthCoordinator::new(
            &stream,
            Credentials::user("admin@default", "pw"),
            Duration::from_secs(1),
        );
        stream.publish(message(ContentType::AuthRequest, None));

        let (mut ours, mut server) = tokio::io::duplex(1024);
        let task_stream = stream.clone();
        let task = tokio::spawn(async move {
            coordinator
                .run(&task_stream, &mut ours)
                .await
        });

        let expected = "userauth admin@default:pw\n\n";
        assert_eq!(read_exact_string(&mut server, expected.len()).await, expected);
        stream.publish(message(ContentType::CommandReply, Some("+OK accepted")));
        assert!(task
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejected_password() {
        let stream = MessageStream::new();
        let coordinator =
            AuthCoordinator::new(&stream, Credentials::password("wrong"), Duration::from_secs(1));
        stream.publish(message(ContentType::AuthRequest, None));

        let (mut ours, mut server) = tokio::io::duplex(1024);
        let task_stream = stream.clone();
        let task = tokio::spawn(async move {
            coordinator
                .run(&task_stream, &mut ours)
                .await
        });

        read_exact_string(&mut server, "auth wrong\n\n".len()).await;
        stream.publish(message(ContentType::CommandReply, Some("-ERR invalid")));

        let err = task
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EslError::AuthFailed { ref reason } if reason == "-ERR invalid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_challenge_times_out() {
        let stream = MessageStream::new();
        let coordinator = AuthCoordinator::new(
            &stream,
            Credentials::password("ClueCon"),
            Duration::from_millis(2000),
        );
        let (mut ours, _server) = tokio::io::duplex(1024);

        let err = coordinator
            .run(&stream, &mut ours)
            .await
            .unwrap_err();
        assert!(
            matches!(err, EslError::AuthFailed { ref reason } if reason.contains("no auth/request"))
        );
        assert_eq!(stream.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out() {
        let stream = MessageStream::new();
        let coordinator = AuthCoordinator::new(
            &stream,
            Credentials::password("ClueCon"),
            Duration::from_millis(2000),
        );
        stream.publish(message(ContentType::AuthRequest, None));
        let (mut ours, _server) = tokio::io::duplex(1024);

        let err = coordinator
            .run(&stream, &mut ours)
            .await
            .unwrap_err();
        assert!(
            matches!(err, EslError::AuthFailed { ref reason } if reason.contains("no auth reply"))
        );
    }

    #[tokio::test]
    async fn test_stream_closed_before_challenge() {
        let stream = MessageStream::new();
        let coordinator =
            AuthCoordinator::new(&stream, Credentials::password("ClueCon"), Duration::from_secs(1));
        stream.close(DisconnectReason::ConnectionClosed);
        let (mut ours, _server) = tokio::io::duplex(1024);

        let err = coordinator
            .run(&stream, &mut ours)
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::AuthFailed { .. }));
    }

    #[test]
    fn test_user_must_contain_domain() {
        assert!(Credentials::user("admin", "pw")
            .validate()
            .is_err());
        assert!(Credentials::user("admin@default", "pw")
            .validate()
            .is_ok());
        assert!(Credentials::password("pw")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let debug = format!("{:?}", Credentials::user("admin@default", "secret"));
        assert!(debug.contains("admin@default"));
        assert!(!debug.contains("secret"));
        assert!(!format!("{:?}", Credentials::password("secret")).contains("secret"));
    }
}
