//! MQTT topic namespace
//!
//! `ev/charger/{home_id}/{charger_id}/booking/{suffix}`

const BASE: &str = "ev/charger";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Outbound: ask the automation layer for a booking
    RequestSession,
    /// Inbound: booking id and initial authorization amount
    BookingResponse,
    /// Outbound: hold placed, enable the charger
    AuthorizeSession,
    /// Inbound: charger accepted or refused
    AuthorizeResponse,
    /// Inbound: session over, final amount known
    FinalizeSession,
}

impl TopicKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            TopicKind::RequestSession => "request_session",
            TopicKind::BookingResponse => "response",
            TopicKind::AuthorizeSession => "authorize_session",
            TopicKind::AuthorizeResponse => "authorize_session/response",
            TopicKind::FinalizeSession => "finalize_session",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "request_session" => Some(TopicKind::RequestSession),
            "response" => Some(TopicKind::BookingResponse),
            "authorize_session" => Some(TopicKind::AuthorizeSession),
            "authorize_session/response" => Some(TopicKind::AuthorizeResponse),
            "finalize_session" => Some(TopicKind::FinalizeSession),
            _ => None,
        }
    }
}

/// Build a topic for one charger
pub fn topic(home_id: &str, charger_id: &str, kind: TopicKind) -> String {
    format!("{}/{}/{}/booking/{}", BASE, home_id, charger_id, kind.suffix())
}

/// Inbound subscriptions for every charger of a home
pub fn subscriptions(home_id: &str) -> Vec<String> {
    [
        TopicKind::BookingResponse,
        TopicKind::AuthorizeResponse,
        TopicKind::FinalizeSession,
    ]
    .iter()
    .map(|kind| topic(home_id, "+", *kind))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub home_id: String,
    pub charger_id: String,
    pub kind: TopicKind,
}

pub fn parse(topic: &str) -> Option<ParsedTopic> {
    let rest = topic.strip_prefix(BASE)?.strip_prefix('/')?;
    let mut parts = rest.splitn(4, '/');
    let home_id = parts.next().filter(|s| !s.is_empty())?;
    let charger_id = parts.next().filter(|s| !s.is_empty())?;
    if parts.next()? != "booking" {
        return None;
    }
    let kind = TopicKind::from_suffix(parts.next()?)?;

    Some(ParsedTopic {
        home_id: home_id.to_string(),
        charger_id: charger_id.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(
            topic("h1", "c1", TopicKind::RequestSession),
            "ev/charger/h1/c1/booking/request_session"
        );
        assert_eq!(
            topic("h1", "c1", TopicKind::AuthorizeResponse),
            "ev/charger/h1/c1/booking/authorize_session/response"
        );
        assert_eq!(
            subscriptions("h1"),
            vec![
                "ev/charger/h1/+/booking/response",
                "ev/charger/h1/+/booking/authorize_session/response",
                "ev/charger/h1/+/booking/finalize_session",
            ]
        );
    }

    #[test]
    fn test_parse_inbound_topics() {
        let parsed = parse("ev/charger/h1/c1/booking/authorize_session/response").unwrap();
        assert_eq!(parsed.home_id, "h1");
        assert_eq!(parsed.charger_id, "c1");
        assert_eq!(parsed.kind, TopicKind::AuthorizeResponse);

        assert_eq!(
            parse("ev/charger/h1/c2/booking/finalize_session").map(|p| p.kind),
            Some(TopicKind::FinalizeSession)
        );
        assert_eq!(
            parse("ev/charger/h1/c2/booking/response").map(|p| p.kind),
            Some(TopicKind::BookingResponse)
        );
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        assert!(parse("ev/charger/h1/c1/booking/unknown").is_none());
        assert!(parse("ev/charger/h1/c1/status/response").is_none());
        assert!(parse("ev/charger/h1//booking/response").is_none());
        assert!(parse("ev/chargers/h1/c1/booking/response").is_none());
        assert!(parse("homeassistant/status").is_none());
    }
}
