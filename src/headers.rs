//! Header names the correlation engine reads from inbound messages.

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

define_header_enum! {
    error_type: ParseEventHeaderError,
    /// Event headers used for routing messages to waiters and subscribers.
    ///
    /// Pass to [`EslMessage::header()`](crate::EslMessage::header) for typed lookups.
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        UniqueId => "Unique-ID",
        CallerUniqueId => "Caller-Unique-ID",
        OtherLegUniqueId => "Other-Leg-Unique-ID",
        JobUuid => "Job-UUID",
        JobCommand => "Job-Command",
        JobCommandArg => "Job-Command-Arg",
        ChannelName => "Channel-Name",
        AnswerState => "Answer-State",
        HangupCause => "Hangup-Cause",
        CoreUuid => "Core-UUID",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(EventHeader::UniqueId.to_string(), "Unique-ID");
        assert_eq!(EventHeader::JobUuid.as_str(), "Job-UUID");
        let h: &str = EventHeader::HangupCause.as_ref();
        assert_eq!(h, "Hangup-Cause");
    }

    #[test]
    fn test_from_str_case_insensitive() {
        assert_eq!("job-uuid".parse::<EventHeader>(), Ok(EventHeader::JobUuid));
        assert_eq!(
            "CALLER-UNIQUE-ID".parse::<EventHeader>(),
            Ok(EventHeader::CallerUniqueId)
        );
    }

    #[test]
    fn test_from_str_unknown() {
        let err = "X-Custom"
            .parse::<EventHeader>()
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown event header: X-Custom");
    }
}
