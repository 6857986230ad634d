//! ESL framing and message decoding

use crate::{
    buffer::EslBuffer,
    command::CommandOutcome,
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_LOG_DATA, CONTENT_TYPE_TEXT_EVENT_JSON,
        CONTENT_TYPE_TEXT_EVENT_PLAIN, CONTENT_TYPE_TEXT_EVENT_XML, HEADER_CONTENT_LENGTH,
        HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT, HEADER_TERMINATOR, MAX_MESSAGE_SIZE,
    },
    error::{EslError, EslResult},
    event::{EslEventType, EventFormat},
    headers::EventHeader,
};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;

/// Kind of an inbound message, from its `Content-Type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[non_exhaustive]
pub enum ContentType {
    /// Server asks for credentials
    AuthRequest,
    /// Reply to any non-`api` command
    CommandReply,
    /// Reply to `api`
    ApiResponse,
    /// Event in plain format
    EventPlain,
    /// Event in JSON format
    EventJson,
    /// Event in XML format
    EventXml,
    /// Forwarded log line
    LogData,
    /// Server is about to close the socket
    DisconnectNotice,
    /// Anything else
    Unknown(String),
}

impl ContentType {
    pub fn from_header(value: &str) -> Self {
        match value {
            CONTENT_TYPE_AUTH_REQUEST => ContentType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => ContentType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => ContentType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => ContentType::EventPlain,
            CONTENT_TYPE_TEXT_EVENT_JSON => ContentType::EventJson,
            CONTENT_TYPE_TEXT_EVENT_XML => ContentType::EventXml,
            CONTENT_TYPE_LOG_DATA => ContentType::LogData,
            CONTENT_TYPE_DISCONNECT_NOTICE => ContentType::DisconnectNotice,
            other => ContentType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            ContentType::CommandReply => CONTENT_TYPE_COMMAND_REPLY,
            ContentType::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            ContentType::EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            ContentType::EventJson => CONTENT_TYPE_TEXT_EVENT_JSON,
            ContentType::EventXml => CONTENT_TYPE_TEXT_EVENT_XML,
            ContentType::LogData => CONTENT_TYPE_LOG_DATA,
            ContentType::DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
            ContentType::Unknown(other) => other,
        }
    }

    /// Event in any format.
    pub fn is_event(&self) -> bool {
        self.event_format()
            .is_some()
    }

    /// Synchronous reply to a command (`command/reply` or `api/response`).
    pub fn is_reply(&self) -> bool {
        matches!(self, ContentType::CommandReply | ContentType::ApiResponse)
    }

    pub fn event_format(&self) -> Option<EventFormat> {
        EventFormat::from_content_type(self.as_str())
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded inbound message.
///
/// For events, `headers` holds the event's own headers (the envelope is
/// discarded) and `body` the event body, whatever the wire format was.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EslMessage {
    content_type: ContentType,
    headers: HashMap<String, String>,
    event_type: Option<EslEventType>,
    body: Option<String>,
}

impl EslMessage {
    /// Build a message. The event type is taken from `Event-Name` when present.
    pub fn new(
        content_type: ContentType,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        let event_type = headers
            .get(EventHeader::EventName.as_str())
            .and_then(|name| EslEventType::parse_event_type(name));
        Self {
            content_type,
            headers,
            event_type,
            body,
        }
    }

    /// Event message with the given headers, in plain format.
    pub fn event<K, V>(headers: impl IntoIterator<Item = (K, V)>, body: Option<String>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(ContentType::EventPlain, headers, body)
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn is_event(&self) -> bool {
        self.content_type
            .is_event()
    }

    /// Event type parsed from `Event-Name`, if recognized.
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_type
    }

    /// `true` for a `BACKGROUND_JOB` event.
    pub fn is_background_job(&self) -> bool {
        self.is_event() && self.event_type == Some(EslEventType::BackgroundJob)
    }

    /// Look up a header by name (case-sensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Call identifier: `Unique-ID`, falling back to `Caller-Unique-ID`.
    pub fn call_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Job-UUID` header, present on `bgapi` replies and `BACKGROUND_JOB` events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `Hangup-Cause` header (e.g. `NORMAL_CLEARING`).
    pub fn hangup_cause(&self) -> Option<&str> {
        self.header(EventHeader::HangupCause)
    }

    /// Success or failure carried by this message.
    ///
    /// Command replies carry the status in `Reply-Text`; `api` responses and
    /// job results carry it at the start of the body.
    pub fn outcome(&self) -> CommandOutcome {
        match self.content_type {
            ContentType::CommandReply => CommandOutcome::from_status_text(self.reply_text()),
            _ => CommandOutcome::from_status_text(self.body()),
        }
    }
}

/// Headers and optional body of one framed message, before decoding.
#[derive(Debug)]
struct Frame {
    headers: HashMap<String, String>,
    body: Option<String>,
}

#[derive(Debug)]
enum ParseState {
    Headers,
    Body {
        headers: HashMap<String, String>,
        length: usize,
    },
}

/// Incremental ESL parser. Feed bytes with [`add_data`](Self::add_data) and
/// pull decoded messages with [`parse_message`](Self::parse_message).
pub struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::Headers,
        }
    }

    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Next complete message, or `None` if more bytes are needed.
    ///
    /// Any error means the byte stream is out of sync and the connection
    /// cannot be recovered.
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        match self.next_frame()? {
            Some(frame) => decode_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    fn next_frame(&mut self) -> EslResult<Option<Frame>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::Headers) {
                ParseState::Headers => {
                    let Some(raw) = self
                        .buffer
                        .extract_until_pattern(HEADER_TERMINATOR.as_bytes())
                    else {
                        return Ok(None);
                    };
                    self.buffer
                        .compact();

                    let text = String::from_utf8(raw)
                        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in headers"))?;
                    let headers = parse_headers(&text)?;
                    if !headers.contains_key(HEADER_CONTENT_TYPE) {
                        return Err(EslError::protocol_error(
                            "Missing Content-Type header, stream is out of sync",
                        ));
                    }

                    let length = content_length(&headers)?;
                    if length == 0 {
                        return Ok(Some(Frame {
                            headers,
                            body: None,
                        }));
                    }
                    self.state = ParseState::Body { headers, length };
                }
                ParseState::Body { headers, length } => {
                    let Some(raw) = self
                        .buffer
                        .extract_bytes(length)
                    else {
                        self.state = ParseState::Body { headers, length };
                        return Ok(None);
                    };
                    self.buffer
                        .compact();

                    let body = String::from_utf8(raw)
                        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in body"))?;
                    return Ok(Some(Frame {
                        headers,
                        body: Some(body),
                    }));
                }
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

fn content_length(headers: &HashMap<String, String>) -> EslResult<usize> {
    let Some(raw) = headers.get(HEADER_CONTENT_LENGTH) else {
        return Ok(0);
    };
    let length: usize = raw
        .trim()
        .parse()
        .map_err(|_| EslError::InvalidHeader {
            header: format!("{}: {}", HEADER_CONTENT_LENGTH, raw),
        })?;
    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::protocol_error(format!(
            "Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Split `Name: value` lines, percent-decoding values. Undecodable values are
/// kept raw.
fn parse_headers(text: &str) -> EslResult<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(EslError::InvalidHeader {
                header: line.to_string(),
            });
        };
        headers.insert(name.trim().to_string(), decode_value(value.trim()));
    }
    Ok(headers)
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn decode_frame(frame: Frame) -> EslResult<EslMessage> {
    let content_type = frame
        .headers
        .get(HEADER_CONTENT_TYPE)
        .map(|ct| ContentType::from_header(ct))
        .unwrap_or_else(|| ContentType::Unknown(String::new()));

    let Some(format) = content_type.event_format() else {
        return Ok(EslMessage::new(content_type, frame.headers, frame.body));
    };

    let body = frame
        .body
        .ok_or_else(|| EslError::protocol_error(format!("{} event without body", format)))?;
    let (headers, body) = match format {
        EventFormat::Plain => decode_plain_event(&body)?,
        EventFormat::Json => decode_json_event(&body)?,
        EventFormat::Xml => decode_xml_event(&body)?,
    };
    Ok(EslMessage::new(content_type, headers, body))
}

/// Plain event body: percent-encoded `Name: value` lines, a blank line, then
/// the optional event body (e.g. a `BACKGROUND_JOB` result).
fn decode_plain_event(body: &str) -> EslResult<(HashMap<String, String>, Option<String>)> {
    let (header_section, inner_body) = match body.split_once(HEADER_TERMINATOR) {
        Some((headers, rest)) => (headers, Some(rest)),
        None => (body, None),
    };

    let mut headers = HashMap::new();
    for line in header_section.lines() {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), decode_value(value.trim()));
        }
    }

    let inner_body = inner_body
        .filter(|b| !b.is_empty())
        .map(str::to_string);
    Ok((headers, inner_body))
}

/// JSON event body: a flat object, with the event body under `_body`.
fn decode_json_event(body: &str) -> EslResult<(HashMap<String, String>, Option<String>)> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let serde_json::Value::Object(fields) = value else {
        return Err(EslError::protocol_error("JSON event is not an object"));
    };

    let mut headers = HashMap::new();
    let mut event_body = None;
    for (key, value) in fields {
        let text = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        if key == "_body" {
            event_body = Some(text);
        } else {
            headers.insert(key, text);
        }
    }
    Ok((headers, event_body))
}

/// XML event body: `<event><headers><Name>value</Name>...</headers><body>...</body></event>`.
fn decode_xml_event(body: &str) -> EslResult<(HashMap<String, String>, Option<String>)> {
    use quick_xml::events::Event as XmlEvent;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(body);
    let mut headers = HashMap::new();
    let mut event_body = None;
    let mut in_headers = false;
    let mut in_body = false;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(tag) => {
                let name = String::from_utf8_lossy(
                    tag.name()
                        .as_ref(),
                )
                .into_owned();
                match name.as_str() {
                    "headers" => in_headers = true,
                    "body" => in_body = true,
                    _ if in_headers => current = Some(name),
                    _ => {}
                }
            }
            XmlEvent::End(tag) => match tag
                .name()
                .as_ref()
            {
                b"headers" => in_headers = false,
                b"body" => in_body = false,
                _ => current = None,
            },
            XmlEvent::Text(text) => {
                let value = text
                    .unescape()?
                    .into_owned();
                if in_body {
                    event_body = Some(value);
                } else if let Some(name) = &current {
                    headers.insert(name.clone(), value);
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    Ok((headers, event_body))
}
