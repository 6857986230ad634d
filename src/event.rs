//! Event formats and FreeSWITCH event types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event encodings FreeSWITCH can use on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventFormat {
    /// `text/event-plain`, the default
    Plain,
    /// `text/event-json`
    Json,
    /// `text/event-xml`
    Xml,
}

impl EventFormat {
    /// Format carried by a Content-Type header value, if it is an event type.
    pub fn from_content_type(ct: &str) -> Option<Self> {
        match ct {
            "text/event-plain" => Some(Self::Plain),
            "text/event-json" => Some(Self::Json),
            "text/event-xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Json => write!(f, "json"),
            EventFormat::Xml => write!(f, "xml"),
        }
    }
}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

/// Builds `EslEventType` from `Variant => "WIRE_NAME"` pairs.
macro_rules! esl_event_types {
    (
        $(
            $(#[$attr:meta])*
            $variant:ident => $wire:literal
        ),+ $(,)?
    ) => {
        /// FreeSWITCH event names, in `switch_event.c` order.
        ///
        /// Variant names mirror the wire names (`ChannelAnswer` = `CHANNEL_ANSWER`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum EslEventType {
            $(
                $(#[$attr])*
                $variant,
            )+
        }

        impl EslEventType {
            /// Wire name, as sent in `Event-Name` and `event` commands.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( EslEventType::$variant => $wire, )+
                }
            }

            /// Case-insensitive lookup by wire name.
            pub fn parse_event_type(s: &str) -> Option<Self> {
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Some(EslEventType::$variant);
                    }
                )+
                None
            }
        }

        impl fmt::Display for EslEventType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for EslEventType {
            type Err = ParseEventTypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_event_type(s).ok_or_else(|| ParseEventTypeError(s.to_string()))
            }
        }
    };
}

esl_event_types! {
    Custom => "CUSTOM",
    Clone => "CLONE",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelDestroy => "CHANNEL_DESTROY",
    ChannelState => "CHANNEL_STATE",
    ChannelCallstate => "CHANNEL_CALLSTATE",
    ChannelAnswer => "CHANNEL_ANSWER",
    ChannelHangup => "CHANNEL_HANGUP",
    ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
    ChannelExecute => "CHANNEL_EXECUTE",
    ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
    ChannelHold => "CHANNEL_HOLD",
    ChannelUnhold => "CHANNEL_UNHOLD",
    ChannelBridge => "CHANNEL_BRIDGE",
    ChannelUnbridge => "CHANNEL_UNBRIDGE",
    ChannelProgress => "CHANNEL_PROGRESS",
    ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
    ChannelOutgoing => "CHANNEL_OUTGOING",
    ChannelPark => "CHANNEL_PARK",
    ChannelUnpark => "CHANNEL_UNPARK",
    ChannelApplication => "CHANNEL_APPLICATION",
    ChannelOriginate => "CHANNEL_ORIGINATE",
    ChannelUuid => "CHANNEL_UUID",
    Api => "API",
    Log => "LOG",
    InboundChan => "INBOUND_CHAN",
    OutboundChan => "OUTBOUND_CHAN",
    Startup => "STARTUP",
    Shutdown => "SHUTDOWN",
    Publish => "PUBLISH",
    Unpublish => "UNPUBLISH",
    Talk => "TALK",
    Notalk => "NOTALK",
    SessionCrash => "SESSION_CRASH",
    ModuleLoad => "MODULE_LOAD",
    ModuleUnload => "MODULE_UNLOAD",
    Dtmf => "DTMF",
    Message => "MESSAGE",
    PresenceIn => "PRESENCE_IN",
    NotifyIn => "NOTIFY_IN",
    PresenceOut => "PRESENCE_OUT",
    PresenceProbe => "PRESENCE_PROBE",
    MessageWaiting => "MESSAGE_WAITING",
    MessageQuery => "MESSAGE_QUERY",
    Roster => "ROSTER",
    Codec => "CODEC",
    BackgroundJob => "BACKGROUND_JOB",
    DetectedSpeech => "DETECTED_SPEECH",
    DetectedTone => "DETECTED_TONE",
    PrivateCommand => "PRIVATE_COMMAND",
    Heartbeat => "HEARTBEAT",
    Trap => "TRAP",
    AddSchedule => "ADD_SCHEDULE",
    DelSchedule => "DEL_SCHEDULE",
    ExeSchedule => "EXE_SCHEDULE",
    ReSchedule => "RE_SCHEDULE",
    ReloadXml => "RELOADXML",
    Notify => "NOTIFY",
    PhoneFeature => "PHONE_FEATURE",
    PhoneFeatureSubscribe => "PHONE_FEATURE_SUBSCRIBE",
    SendMessage => "SEND_MESSAGE",
    RecvMessage => "RECV_MESSAGE",
    RequestParams => "REQUEST_PARAMS",
    ChannelData => "CHANNEL_DATA",
    General => "GENERAL",
    Command => "COMMAND",
    SessionHeartbeat => "SESSION_HEARTBEAT",
    ClientDisconnected => "CLIENT_DISCONNECTED",
    ServerDisconnected => "SERVER_DISCONNECTED",
    SendInfo => "SEND_INFO",
    RecvInfo => "RECV_INFO",
    RecvRtcpMessage => "RECV_RTCP_MESSAGE",
    SendRtcpMessage => "SEND_RTCP_MESSAGE",
    CallSecure => "CALL_SECURE",
    Nat => "NAT",
    RecordStart => "RECORD_START",
    RecordStop => "RECORD_STOP",
    PlaybackStart => "PLAYBACK_START",
    PlaybackStop => "PLAYBACK_STOP",
    CallUpdate => "CALL_UPDATE",
    Failure => "FAILURE",
    SocketData => "SOCKET_DATA",
    MediaBugStart => "MEDIA_BUG_START",
    MediaBugStop => "MEDIA_BUG_STOP",
    ConferenceDataQuery => "CONFERENCE_DATA_QUERY",
    ConferenceData => "CONFERENCE_DATA",
    CallSetupReq => "CALL_SETUP_REQ",
    CallSetupResult => "CALL_SETUP_RESULT",
    CallDetail => "CALL_DETAIL",
    DeviceState => "DEVICE_STATE",
    Text => "TEXT",
    ShutdownRequested => "SHUTDOWN_REQUESTED",
    StartRecording => "START_RECORDING",
    /// Only meaningful in `event` subscriptions.
    All => "ALL",
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

impl EslEventType {
    /// Channel lifecycle events that end an originate wait.
    pub fn is_call_terminal(&self) -> bool {
        matches!(
            self,
            EslEventType::ChannelAnswer | EslEventType::ChannelHangup
        )
    }

    /// Ringing or early media.
    pub fn is_early_media(&self) -> bool {
        matches!(
            self,
            EslEventType::ChannelProgress | EslEventType::ChannelProgressMedia
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_type_case_insensitive() {
        assert_eq!(
            EslEventType::parse_event_type("BACKGROUND_JOB"),
            Some(EslEventType::BackgroundJob)
        );
        assert_eq!(
            EslEventType::parse_event_type("channel_answer"),
            Some(EslEventType::ChannelAnswer)
        );
        assert_eq!(EslEventType::parse_event_type("NOT_AN_EVENT"), None);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(EslEventType::ChannelHangup.to_string(), "CHANNEL_HANGUP");
        assert_eq!(
            EslEventType::ChannelProgressMedia.to_string(),
            "CHANNEL_PROGRESS_MEDIA"
        );
        assert_eq!(EslEventType::ReloadXml.to_string(), "RELOADXML");
        assert_eq!(EslEventType::StartRecording.to_string(), "START_RECORDING");
    }

    #[test]
    fn test_event_type_from_str() {
        assert_eq!(
            "CHANNEL_PROGRESS".parse::<EslEventType>(),
            Ok(EslEventType::ChannelProgress)
        );
        let err = "BOGUS"
            .parse::<EslEventType>()
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown event type: BOGUS");
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(EslEventType::ChannelAnswer.is_call_terminal());
        assert!(EslEventType::ChannelHangup.is_call_terminal());
        assert!(!EslEventType::ChannelHangupComplete.is_call_terminal());
        assert!(EslEventType::ChannelProgress.is_early_media());
        assert!(EslEventType::ChannelProgressMedia.is_early_media());
        assert!(!EslEventType::ChannelAnswer.is_early_media());
    }

    #[test]
    fn test_event_format_round_trip() {
        for format in [EventFormat::Plain, EventFormat::Json, EventFormat::Xml] {
            assert_eq!(format.to_string().parse::<EventFormat>(), Ok(format));
        }
        assert!("yaml"
            .parse::<EventFormat>()
            .is_err());
    }

    #[test]
    fn test_event_format_from_content_type() {
        assert_eq!(
            EventFormat::from_content_type("text/event-json"),
            Some(EventFormat::Json)
        );
        assert_eq!(
            EventFormat::from_content_type("text/event-plain"),
            Some(EventFormat::Plain)
        );
        assert_eq!(EventFormat::from_content_type("command/reply"), None);
    }
}
