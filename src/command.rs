//! Outgoing commands and reply classification

use crate::{
    constants::{HEADER_TERMINATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    headers::EventHeader,
};
use std::fmt;

/// ESL commands are line-delimited; an embedded newline would let a caller
/// smuggle a second command onto the wire.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::ProtocolError {
            message: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}

/// Status prefix of a reply or job result.
///
/// FreeSWITCH answers `+OK …` on success and `-ERR …` on failure. `api`
/// commands such as `status` return free text with neither prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Starts with `+OK`, or is absent/empty.
    Ok,
    /// Starts with `-ERR`.
    Err,
    /// Anything else.
    Other,
}

impl ReplyStatus {
    fn classify(text: Option<&str>) -> Self {
        match text.map(str::trim_start) {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        }
    }
}

/// Success or failure of a command reply or a background job result,
/// together with the text it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    status: ReplyStatus,
    text: String,
}

impl CommandOutcome {
    /// Classify `Reply-Text` or a result body. Trailing whitespace is dropped.
    pub fn from_status_text(text: Option<&str>) -> Self {
        Self {
            status: ReplyStatus::classify(text),
            text: text
                .map(|t| t.trim().to_string())
                .unwrap_or_default(),
        }
    }

    /// `true` only for `+OK` (or an empty reply).
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    /// Full status text, e.g. `+OK 7f4de4bc-…` or `-ERR NO_ANSWER`.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Failure text without the `-ERR` prefix. `None` on success.
    ///
    /// ```
    /// # use freeswitch_esl_inbound::CommandOutcome;
    /// let outcome = CommandOutcome::from_status_text(Some("-ERR USER_BUSY\n"));
    /// assert_eq!(outcome.error_message(), Some("USER_BUSY"));
    /// ```
    pub fn error_message(&self) -> Option<&str> {
        if self.is_success() {
            return None;
        }
        let stripped = self
            .text
            .strip_prefix("-ERR")
            .unwrap_or(&self.text)
            .trim();
        Some(stripped)
    }

    /// `Ok` on success, [`EslError::CommandFailed`] on `-ERR` and
    /// [`EslError::UnexpectedReply`] otherwise.
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Ok => Ok(self),
            ReplyStatus::Err => Err(EslError::CommandFailed {
                reply_text: self.text,
            }),
            ReplyStatus::Other => Err(EslError::UnexpectedReply {
                reply_text: self.text,
            }),
        }
    }
}

/// Builds a command line followed by header lines and an optional
/// length-delimited body.
#[derive(Debug)]
pub(crate) struct CommandBuilder {
    command: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl CommandBuilder {
    pub(crate) fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn header(mut self, name: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        self.headers
            .push((name.to_string(), value.to_string()));
        Ok(self)
    }

    #[cfg(test)]
    pub(crate) fn body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub(crate) fn build(self) -> String {
        use std::fmt::Write;
        let mut result = self.command;
        result.push_str(LINE_TERMINATOR);

        for (key, value) in &self.headers {
            let _ = write!(result, "{}: {}{}", key, value, LINE_TERMINATOR);
        }

        if let Some(body) = &self.body {
            let _ = write!(result, "Content-Length: {}{}", body.len(), LINE_TERMINATOR);
            result.push_str(LINE_TERMINATOR);
            result.push_str(body);
        } else {
            result.push_str(LINE_TERMINATOR);
        }

        result
    }
}

/// Commands the inbound client sends.
#[derive(Clone)]
pub enum EslCommand {
    /// `auth <password>`
    Auth { password: String },
    /// `userauth <user>:<password>`
    UserAuth { user: String, password: String },
    /// Synchronous `api`
    Api { command: String },
    /// `bgapi`, optionally pinning the job id the server will report
    BgApi {
        command: String,
        job_uuid: Option<String>,
    },
    /// `event <format> <events>`
    Events { format: String, events: String },
    /// `filter <header> <value>`
    Filter { header: String, value: String },
    /// `filter delete …`
    FilterDelete {
        header: String,
        value: Option<String>,
    },
    /// `nixevent <events>`
    NixEvent { events: String },
    /// `noevents`
    NoEvents,
    /// `noop`
    NoOp,
    /// `exit`
    Exit,
}

impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslCommand::Auth { .. } => f
                .debug_struct("Auth")
                .field("password", &"[REDACTED]")
                .finish(),
            EslCommand::UserAuth { user, .. } => f
                .debug_struct("UserAuth")
                .field("user", user)
                .field("password", &"[REDACTED]")
                .finish(),
            EslCommand::Api { command } => f
                .debug_struct("Api")
                .field("command", command)
                .finish(),
            EslCommand::BgApi { command, job_uuid } => f
                .debug_struct("BgApi")
                .field("command", command)
                .field("job_uuid", job_uuid)
                .finish(),
            EslCommand::Events { format, events } => f
                .debug_struct("Events")
                .field("format", format)
                .field("events", events)
                .finish(),
            EslCommand::Filter { header, value } => f
                .debug_struct("Filter")
                .field("header", header)
                .field("value", value)
                .finish(),
            EslCommand::FilterDelete { header, value } => f
                .debug_struct("FilterDelete")
                .field("header", header)
                .field("value", value)
                .finish(),
            EslCommand::NixEvent { events } => f
                .debug_struct("NixEvent")
                .field("events", events)
                .finish(),
            EslCommand::NoEvents => write!(f, "NoEvents"),
            EslCommand::NoOp => write!(f, "NoOp"),
            EslCommand::Exit => write!(f, "Exit"),
        }
    }
}

impl EslCommand {
    fn format_simple_command(cmd: &str, args: &[&str]) -> String {
        let mut result = String::from(cmd);
        for arg in args {
            result.push(' ');
            result.push_str(arg);
        }
        result.push_str(HEADER_TERMINATOR);
        result
    }

    /// `true` for commands whose synchronous reply is `api/response`.
    pub(crate) fn expects_api_response(&self) -> bool {
        matches!(self, EslCommand::Api { .. })
    }

    /// Validate user-supplied fields and render the wire text.
    pub fn to_wire_format(&self) -> EslResult<String> {
        match self {
            EslCommand::Auth { password } => {
                validate_no_newlines(password, "password")?;
                Ok(Self::format_simple_command("auth", &[password]))
            }
            EslCommand::UserAuth { user, password } => {
                validate_no_newlines(user, "user")?;
                validate_no_newlines(password, "password")?;
                Ok(Self::format_simple_command(
                    "userauth",
                    &[&format!("{}:{}", user, password)],
                ))
            }
            EslCommand::Api { command } => {
                validate_no_newlines(command, "api command")?;
                Ok(Self::format_simple_command("api", &[command]))
            }
            EslCommand::BgApi { command, job_uuid } => {
                validate_no_newlines(command, "bgapi command")?;
                match job_uuid {
                    Some(id) => Ok(CommandBuilder::new(&format!("bgapi {}", command))
                        .header(EventHeader::JobUuid.as_str(), id)?
                        .build()),
                    None => Ok(Self::format_simple_command("bgapi", &[command])),
                }
            }
            EslCommand::Events { format, events } => {
                validate_no_newlines(format, "event format")?;
                validate_no_newlines(events, "event list")?;
                Ok(Self::format_simple_command("event", &[format, events]))
            }
            EslCommand::Filter { header, value } => {
                validate_no_newlines(header, "filter header")?;
                validate_no_newlines(value, "filter value")?;
                Ok(Self::format_simple_command("filter", &[header, value]))
            }
            EslCommand::FilterDelete { header, value } => {
                validate_no_newlines(header, "filter delete header")?;
                if let Some(v) = value {
                    validate_no_newlines(v, "filter delete value")?;
                }
                Ok(match value {
                    Some(v) if header != "all" => {
                        Self::format_simple_command("filter", &["delete", header, v])
                    }
                    _ => Self::format_simple_command("filter", &["delete", header]),
                })
            }
            EslCommand::NixEvent { events } => {
                validate_no_newlines(events, "nixevent list")?;
                Ok(Self::format_simple_command("nixevent", &[events]))
            }
            EslCommand::NoEvents => Ok(Self::format_simple_command("noevents", &[])),
            EslCommand::NoOp => Ok(Self::format_simple_command("noop", &[])),
            EslCommand::Exit => Ok(Self::format_simple_command("exit", &[])),
        }
    }
}
