//! Widget events as they arrive from the backend.
//!
//! On the wire an event is `{"event": "<kind>-<phase>", "payload": {...}}`.
//! Decoding resolves the name into a [`WidgetKind`] / [`WidgetPhase`] pair
//! from a closed set and rejects created events that break the vote-url
//! invariant.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::pdt_format;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown widget event {0}")]
    UnknownEvent(String),
    #[error("{kind} widgets have no {phase} phase")]
    UnsupportedPhase { kind: &'static str, phase: &'static str },
    #[error("option {option_id} of widget {widget_id} has no vote url")]
    MissingVoteUrl { widget_id: String, option_id: String },
    #[error("widget {widget_id} repeats vote url {vote_url}")]
    DuplicateVoteUrl { widget_id: String, vote_url: String },
    #[error("invalid event json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WidgetKind {
    TextPoll,
    ImagePoll,
    TextQuiz,
    ImageQuiz,
    TextPrediction,
    ImagePrediction,
    ImageSlider,
    CheerMeter,
    Alert,
}

const ALL_KINDS: [WidgetKind; 9] = [
    WidgetKind::TextPoll,
    WidgetKind::ImagePoll,
    WidgetKind::TextQuiz,
    WidgetKind::ImageQuiz,
    WidgetKind::TextPrediction,
    WidgetKind::ImagePrediction,
    WidgetKind::ImageSlider,
    WidgetKind::CheerMeter,
    WidgetKind::Alert,
];

impl WidgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WidgetKind::TextPoll => "text-poll",
            WidgetKind::ImagePoll => "image-poll",
            WidgetKind::TextQuiz => "text-quiz",
            WidgetKind::ImageQuiz => "image-quiz",
            WidgetKind::TextPrediction => "text-prediction",
            WidgetKind::ImagePrediction => "image-prediction",
            WidgetKind::ImageSlider => "image-slider",
            WidgetKind::CheerMeter => "cheer-meter",
            WidgetKind::Alert => "alert",
        }
    }

    pub fn supports(self, phase: WidgetPhase) -> bool {
        match phase {
            WidgetPhase::Created => true,
            WidgetPhase::FollowUp => {
                matches!(self, WidgetKind::TextPrediction | WidgetKind::ImagePrediction)
            }
            WidgetPhase::Results => !matches!(
                self,
                WidgetKind::TextPrediction | WidgetKind::ImagePrediction | WidgetKind::Alert
            ),
        }
    }

    /// Alerts are the only kind the viewer cannot vote on.
    pub fn is_votable(self) -> bool {
        self != WidgetKind::Alert
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WidgetPhase {
    Created,
    FollowUp,
    Results,
}

impl WidgetPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WidgetPhase::Created => "created",
            WidgetPhase::FollowUp => "follow-up",
            WidgetPhase::Results => "results",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetOption {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetPayload {
    pub id: String,
    pub subscribe_channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impression_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewards_url: Option<String>,
    #[serde(
        default,
        with = "pdt_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub program_date_time: Option<DateTime<Utc>>,
    #[serde(with = "iso_duration")]
    pub timeout: Duration,
    /// Poll, prediction, slider and cheer-meter options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<WidgetOption>,
    /// Quiz choices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<WidgetOption>,
    /// Alert artwork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl WidgetPayload {
    pub fn new(id: impl Into<String>, subscribe_channel: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            subscribe_channel: subscribe_channel.into(),
            question: None,
            impression_url: None,
            rewards_url: None,
            program_date_time: None,
            timeout,
            options: Vec::new(),
            choices: Vec::new(),
            image_url: None,
        }
    }

    fn selectable(&self) -> impl Iterator<Item = &WidgetOption> {
        self.options.iter().chain(self.choices.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct ClientEvent {
    kind: WidgetKind,
    phase: WidgetPhase,
    payload: WidgetPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    event: String,
    payload: WidgetPayload,
}

impl ClientEvent {
    pub fn new(kind: WidgetKind, phase: WidgetPhase, payload: WidgetPayload) -> Result<Self, EventError> {
        if !kind.supports(phase) {
            return Err(EventError::UnsupportedPhase {
                kind: kind.as_str(),
                phase: phase.as_str(),
            });
        }
        let event = Self {
            kind,
            phase,
            payload,
        };
        event.check_vote_urls()?;
        Ok(event)
    }

    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        serde_json::from_str(raw).map_err(|err| EventError::Json(err.to_string()))
    }

    pub fn kind(&self) -> WidgetKind {
        self.kind
    }

    pub fn phase(&self) -> WidgetPhase {
        self.phase
    }

    pub fn payload(&self) -> &WidgetPayload {
        &self.payload
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn event_name(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.phase.as_str())
    }

    /// Follow-ups only make sense to a viewer who voted on the created widget.
    pub fn requires_vote(&self) -> bool {
        self.phase == WidgetPhase::FollowUp
    }

    /// Distinct image URLs of a created event, in payload order.
    pub fn image_urls(&self) -> Vec<String> {
        if self.phase != WidgetPhase::Created {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        self.payload
            .selectable()
            .filter_map(|option| option.image_url.as_deref())
            .chain(self.payload.image_url.as_deref())
            .filter(|url| seen.insert(*url))
            .map(str::to_string)
            .collect()
    }

    fn check_vote_urls(&self) -> Result<(), EventError> {
        if self.phase != WidgetPhase::Created || !self.kind.is_votable() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        for option in self.payload.selectable() {
            let vote_url = option
                .vote_url
                .as_deref()
                .ok_or_else(|| EventError::MissingVoteUrl {
                    widget_id: self.payload.id.clone(),
                    option_id: option.id.clone(),
                })?;
            if !seen.insert(vote_url) {
                return Err(EventError::DuplicateVoteUrl {
                    widget_id: self.payload.id.clone(),
                    vote_url: vote_url.to_string(),
                });
            }
        }
        Ok(())
    }
}

pub fn parse_event_name(name: &str) -> Result<(WidgetKind, WidgetPhase), EventError> {
    let phase = [WidgetPhase::Created, WidgetPhase::FollowUp, WidgetPhase::Results]
        .into_iter()
        .find(|phase| {
            name.strip_suffix(phase.as_str())
                .is_some_and(|rest| rest.ends_with('-'))
        })
        .ok_or_else(|| EventError::UnknownEvent(name.to_string()))?;
    let prefix = &name[..name.len() - phase.as_str().len() - 1];
    let kind = ALL_KINDS
        .into_iter()
        .find(|kind| kind.as_str() == prefix)
        .ok_or_else(|| EventError::UnknownEvent(name.to_string()))?;
    Ok((kind, phase))
}

impl TryFrom<WireEvent> for ClientEvent {
    type Error = EventError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let (kind, phase) = parse_event_name(&wire.event)?;
        ClientEvent::new(kind, phase, wire.payload)
    }
}

impl From<ClientEvent> for WireEvent {
    fn from(event: ClientEvent) -> Self {
        WireEvent {
            event: event.event_name(),
            payload: event.payload,
        }
    }
}

/// A vote recorded for a widget; consumed by the matching follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
}

/// What travels between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetProxyPublishData {
    pub event: ClientEvent,
    pub vote: Option<Vote>,
}

impl WidgetProxyPublishData {
    pub fn new(event: ClientEvent) -> Self {
        Self { event, vote: None }
    }

    pub fn with_vote(self, vote: Vote) -> Self {
        Self {
            vote: Some(vote),
            ..self
        }
    }
}

impl From<ClientEvent> for WidgetProxyPublishData {
    fn from(event: ClientEvent) -> Self {
        Self::new(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// A follow-up arrived for a widget the viewer never voted on.
    NoVote,
    /// The pipeline was shut down before the event could be shown.
    PipelineShutdown,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::NoVote => "no_vote",
            DiscardReason::PipelineShutdown => "pipeline_shutdown",
        }
    }
}

/// ISO-8601 durations limited to days, hours, minutes and (fractional) seconds,
/// e.g. `P0DT00H00M10S`.
pub mod iso_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &Duration) -> String {
        let total = value.as_secs();
        let millis = value.subsec_millis();
        let days = total / 86_400;
        let hours = (total % 86_400) / 3_600;
        let minutes = (total % 3_600) / 60;
        let seconds = total % 60;
        if millis == 0 {
            format!("P{days}DT{hours:02}H{minutes:02}M{seconds:02}S")
        } else {
            format!("P{days}DT{hours:02}H{minutes:02}M{seconds:02}.{millis:03}S")
        }
    }

    /// Parses through the `iso8601` grammar. A designator-only value such as
    /// `P` or `PT`, and a non-zero value below the millisecond resolution, are
    /// rejected rather than read as a zero timeout.
    pub fn parse(raw: &str) -> Result<Duration, String> {
        if !raw.bytes().any(|byte| byte.is_ascii_digit()) {
            return Err(format!("duration {raw} has no components"));
        }
        let duration: Duration = raw
            .parse::<iso8601::Duration>()
            .map_err(|err| format!("duration {raw}: {err}"))?
            .into();
        if duration.is_zero() && raw.bytes().any(|byte| matches!(byte, b'1'..=b'9')) {
            return Err(format!("duration {raw} is below millisecond resolution"));
        }
        Ok(duration)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn option(id: &str, vote_url: Option<&str>, image_url: Option<&str>) -> WidgetOption {
        WidgetOption {
            id: id.into(),
            description: Some(format!("option {id}")),
            image_url: image_url.map(Into::into),
            vote_url: vote_url.map(Into::into),
            is_correct: None,
            answer_count: None,
            vote_count: None,
        }
    }

    #[test]
    fn decodes_wire_events() {
        let raw = json!({
            "event": "image-poll-created",
            "payload": {
                "id": "w1",
                "subscribe_channel": "program.w1",
                "impression_url": "https://example.test/impressions/w1",
                "program_date_time": "2024-05-01T18:30:00.250Z",
                "timeout": "P0DT00H00M20S",
                "options": [
                    {"id": "a", "image_url": "https://cdn.test/a.png", "vote_url": "https://example.test/v/a"},
                    {"id": "b", "image_url": "https://cdn.test/b.png", "vote_url": "https://example.test/v/b"}
                ]
            }
        })
        .to_string();
        let event = ClientEvent::from_json(&raw).expect("decodes");
        assert_eq!(event.kind(), WidgetKind::ImagePoll);
        assert_eq!(event.phase(), WidgetPhase::Created);
        assert_eq!(event.payload().timeout, Duration::from_secs(20));
        assert_eq!(
            event.payload().program_date_time.map(|t| t.timestamp_millis()),
            Some(1_714_588_200_250)
        );
        assert_eq!(event.image_urls().len(), 2);

        let encoded = serde_json::to_value(&event).expect("encodes");
        assert_eq!(encoded["event"], "image-poll-created");
        assert_eq!(encoded["payload"]["program_date_time"], "2024-05-01T18:30:00.250Z");
    }

    #[test]
    fn parses_event_names_from_closed_set() {
        assert_eq!(
            parse_event_name("text-prediction-follow-up").unwrap(),
            (WidgetKind::TextPrediction, WidgetPhase::FollowUp)
        );
        assert_eq!(
            parse_event_name("cheer-meter-results").unwrap(),
            (WidgetKind::CheerMeter, WidgetPhase::Results)
        );
        assert!(matches!(
            parse_event_name("emoji-slider-created"),
            Err(EventError::UnknownEvent(_))
        ));
        assert!(matches!(
            parse_event_name("created"),
            Err(EventError::UnknownEvent(_))
        ));
    }

    #[test]
    fn rejects_phases_a_kind_does_not_have() {
        let payload = WidgetPayload::new("w1", "chan", Duration::from_secs(5));
        let err = ClientEvent::new(WidgetKind::Alert, WidgetPhase::Results, payload).unwrap_err();
        assert_eq!(
            err,
            EventError::UnsupportedPhase {
                kind: "alert",
                phase: "results"
            }
        );
    }

    #[test]
    fn created_votable_events_need_unique_vote_urls() {
        let mut payload = WidgetPayload::new("w1", "chan", Duration::from_secs(5));
        payload.options = vec![option("a", Some("v/a"), None), option("b", Some("v/a"), None)];
        let err = ClientEvent::new(WidgetKind::TextPoll, WidgetPhase::Created, payload.clone())
            .unwrap_err();
        assert!(matches!(err, EventError::DuplicateVoteUrl { ref vote_url, .. } if vote_url == "v/a"));

        payload.options[1].vote_url = None;
        let err = ClientEvent::new(WidgetKind::TextPoll, WidgetPhase::Created, payload.clone())
            .unwrap_err();
        assert!(matches!(err, EventError::MissingVoteUrl { ref option_id, .. } if option_id == "b"));

        // Results carry counts, not vote urls.
        ClientEvent::new(WidgetKind::TextPoll, WidgetPhase::Results, payload).expect("results ok");
    }

    #[test]
    fn image_urls_are_deduplicated_and_created_only() {
        let mut payload = WidgetPayload::new("q1", "chan", Duration::from_secs(5));
        payload.choices = vec![
            option("a", Some("v/a"), Some("img/1")),
            option("b", Some("v/b"), Some("img/2")),
            option("c", Some("v/c"), Some("img/1")),
        ];
        let created =
            ClientEvent::new(WidgetKind::ImageQuiz, WidgetPhase::Created, payload.clone()).unwrap();
        assert_eq!(created.image_urls(), vec!["img/1", "img/2"]);

        let results = ClientEvent::new(WidgetKind::ImageQuiz, WidgetPhase::Results, payload).unwrap();
        assert!(results.image_urls().is_empty());
    }

    #[test]
    fn iso_durations() {
        assert_eq!(iso_duration::parse("PT1M30S").unwrap(), Duration::from_secs(90));
        assert_eq!(iso_duration::parse("P1DT00H00M00.5S").unwrap(), Duration::from_millis(86_400_500));
        assert_eq!(iso_duration::parse("P0DT00H00M10S").unwrap(), Duration::from_secs(10));
        assert_eq!(iso_duration::parse("PT0S").unwrap(), Duration::ZERO);
        assert!(iso_duration::parse("ten seconds").is_err());
        assert_eq!(iso_duration::format(&Duration::from_secs(3_725)), "P0DT01H02M05S");
        assert_eq!(iso_duration::format(&Duration::from_millis(1_250)), "P0DT00H00M01.250S");
    }

    #[test]
    fn degenerate_durations_are_not_zero_timeouts() {
        for raw in ["P", "PT", "PT0.0001S"] {
            assert!(iso_duration::parse(raw).is_err(), "{raw} should be rejected");
        }
        let wire = json!({"timeout": "PT"});
        #[derive(Debug, serde::Deserialize)]
        struct Timeout {
            #[serde(with = "iso_duration")]
            #[allow(dead_code)]
            timeout: Duration,
        }
        assert!(serde_json::from_value::<Timeout>(wire).is_err());
    }
}
