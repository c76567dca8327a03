//! Session event stream
//!
//! One `tier_k_complete` event per folded tier, then exactly one terminal
//! event (`complete`, `degraded`, `timeout` or `error`). Events travel over
//! an unbounded channel so a slow or vanished client never stalls the
//! orchestrator. A closed channel means the client disconnected: delivery
//! stops, the computation carries on.

use super::aggregator::FieldDelta;
use super::session::EnrichmentSession;
use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Version of the external field vocabulary
pub const FIELD_VOCABULARY_VERSION: &str = "v1";

/// Internal field name → external name, `v1`
const FIELD_NAMES_V1: &[(&str, &str)] = &[
    ("legal_name", "legal_name"),
    ("display_name", "name"),
    ("registration_id", "company_number"),
    ("founded_year", "founded"),
    ("description", "description"),
    ("industry", "industry"),
    ("employee_range", "employees"),
    ("headquarters", "hq_location"),
    ("country", "country_code"),
    ("phone", "phone"),
    ("linkedin_url", "linkedin"),
    ("rating", "review_rating"),
    ("operating_status", "status"),
];

/// External name for an internal field; unmapped names pass through
pub fn external_field_name(name: &str) -> &str {
    FIELD_NAMES_V1
        .iter()
        .find(|(internal, _)| *internal == name)
        .map_or(name, |(_, external)| external)
}

/// Delivery failure towards the client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Client disconnected")]
    ClientDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Complete,
    Degraded,
    Timeout,
    Error,
}

impl TerminalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Degraded => "degraded",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Current value of one field as sent to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventField {
    pub value: Value,
    pub confidence: u8,
    pub sources: Vec<String>,
}

/// Payload of a `tier_k_complete` event
///
/// `fields` holds every field known after the tier, keyed by external
/// name; `deltas` lists what this tier changed. `cost` is cumulative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierEvent {
    /// Session status after the tier, `tier_k_complete`
    pub status: String,
    pub session_id: Uuid,
    pub tier: u8,
    pub fields: BTreeMap<String, EventField>,
    pub deltas: Vec<FieldDelta>,
    pub succeeded_count: usize,
    pub attempted_count: usize,
    pub from_cache: bool,
    pub elapsed_ms: u64,
    pub cost: f64,
}

/// Payload of the terminal event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalEvent {
    pub session_id: Uuid,
    pub kind: TerminalKind,
    /// Final session status
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Machine-readable kind for `timeout` and `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub field_count: usize,
    pub elapsed_ms: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tier(TierEvent),
    Terminal(TerminalEvent),
}

impl StreamEvent {
    /// SSE event name
    pub fn name(&self) -> String {
        match self {
            Self::Tier(e) => format!("tier_{}_complete", e.tier),
            Self::Terminal(e) => e.kind.as_str().to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn to_sse(&self) -> Result<Event, serde_json::Error> {
        let data = match self {
            Self::Tier(e) => serde_json::to_string(e)?,
            Self::Terminal(e) => serde_json::to_string(e)?,
        };
        Ok(Event::default().event(self.name()).data(data))
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Per-session event sink owned by the orchestrator task
pub struct EventPublisher {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<StreamEvent>,
    disconnected: bool,
}

impl EventPublisher {
    pub fn channel(session_id: Uuid) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                tx,
                disconnected: false,
            },
            rx,
        )
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Emit the event for the session's most recent tier
    pub fn publish_tier(&mut self, session: &EnrichmentSession, deltas: Vec<FieldDelta>) {
        let Some(tier) = session.tier_results.last() else {
            warn!(session_id = %self.session_id, "Tier event requested before any tier finished");
            return;
        };

        let fields = session
            .fields
            .values()
            .map(|entry| {
                (
                    external_field_name(&entry.name).to_string(),
                    EventField {
                        value: entry.value.clone(),
                        confidence: entry.confidence,
                        sources: entry.contributing_sources.clone(),
                    },
                )
            })
            .collect();

        let event = TierEvent {
            status: session.status.to_string(),
            session_id: self.session_id,
            tier: tier.tier_number,
            fields,
            deltas: deltas
                .into_iter()
                .map(|mut d| {
                    d.name = external_field_name(&d.name).to_string();
                    d
                })
                .collect(),
            succeeded_count: tier.succeeded_count,
            attempted_count: tier.attempted_count,
            from_cache: tier.from_cache,
            elapsed_ms: session.total_duration_ms,
            cost: session.total_cost,
        };
        let _ = self.send(StreamEvent::Tier(event));
    }

    pub fn publish_terminal(
        &mut self,
        kind: TerminalKind,
        session: &EnrichmentSession,
        error_kind: Option<&str>,
    ) {
        let event = TerminalEvent {
            session_id: self.session_id,
            kind,
            status: session.status.to_string(),
            reason: session.reason.clone(),
            error_kind: error_kind.map(str::to_string),
            field_count: session.fields.len(),
            elapsed_ms: session.total_duration_ms,
            cost: session.total_cost,
        };
        let _ = self.send(StreamEvent::Terminal(event));
    }

    fn send(&mut self, event: StreamEvent) -> Result<(), ProtocolError> {
        if self.disconnected {
            return Err(ProtocolError::ClientDisconnected);
        }
        let name = event.name();
        if self.tx.send(event).is_err() {
            self.disconnected = true;
            info!(
                session_id = %self.session_id,
                event = %name,
                "{}; enrichment continues without delivery",
                ProtocolError::ClientDisconnected
            );
            return Err(ProtocolError::ClientDisconnected);
        }
        debug!(session_id = %self.session_id, event = %name, "Event published");
        Ok(())
    }
}

/// SSE stream over a session's events, ending after the terminal event
pub fn sse_stream(mut rx: EventReceiver) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            match event.to_sse() {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!("SSE: Failed to serialize event {}: {}", event.name(), e),
            }
            if terminal {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::aggregator::{DeltaKind, FieldEntry};
    use crate::enrichment::session::SessionStatus;
    use crate::types::{DomainKey, FieldClass, TierResult};
    use chrono::Utc;
    use futures::StreamExt;
    use std::time::Duration;

    fn session() -> EnrichmentSession {
        let mut session = EnrichmentSession::new(
            DomainKey::parse("acme.test").unwrap(),
            1,
            Utc::now(),
            Duration::from_secs(60),
        );
        session.tier_results.push(TierResult::new(1, Vec::new(), Utc::now()));
        session.total_cost = 0.25;
        session.total_duration_ms = 120;
        session
    }

    fn delta(name: &str) -> FieldDelta {
        FieldDelta {
            name: name.to_string(),
            value: serde_json::json!("Acme"),
            confidence: 60,
            previous_confidence: None,
            contributing_sources: vec!["website".to_string()],
            kind: DeltaKind::Added,
        }
    }

    #[test]
    fn test_field_names_mapped_or_passed_through() {
        assert_eq!(external_field_name("display_name"), "name");
        assert_eq!(external_field_name("employee_range"), "employees");
        assert_eq!(external_field_name("unknown.ticker"), "unknown.ticker");
    }

    #[tokio::test]
    async fn test_tier_event_carries_mapped_deltas_and_totals() {
        let session = session();
        let (mut publisher, mut rx) = EventPublisher::channel(session.session_id);

        publisher.publish_tier(&session, vec![delta("display_name"), delta("x_rank")]);

        let StreamEvent::Tier(event) = rx.recv().await.unwrap() else {
            panic!("expected tier event");
        };
        assert_eq!(event.tier, 1);
        assert_eq!(event.deltas[0].name, "name");
        assert_eq!(event.deltas[1].name, "x_rank");
        assert_eq!(event.cost, 0.25);
        assert_eq!(event.elapsed_ms, 120);
    }

    #[tokio::test]
    async fn test_event_payloads_carry_status_fields_and_cost() {
        let mut session = session();
        session.status = SessionStatus::TierComplete(1);
        session.fields.insert(
            "display_name".to_string(),
            FieldEntry {
                name: "display_name".to_string(),
                value: serde_json::json!("Acme"),
                confidence: 60,
                contributing_sources: vec!["website".to_string()],
                last_updated_tier: 1,
                class: FieldClass::Stable,
            },
        );
        let (mut publisher, mut rx) = EventPublisher::channel(session.session_id);

        publisher.publish_tier(&session, vec![delta("display_name")]);
        session.status = SessionStatus::Complete;
        publisher.publish_terminal(TerminalKind::Complete, &session, None);

        let StreamEvent::Tier(tier) = rx.recv().await.unwrap() else {
            panic!("expected tier event");
        };
        let json = serde_json::to_value(&tier).unwrap();
        assert_eq!(json["status"], "tier_1_complete");
        assert_eq!(json["fields"]["name"]["value"], "Acme");
        assert_eq!(json["fields"]["name"]["confidence"], 60);
        assert_eq!(json["elapsed_ms"], 120);
        assert_eq!(json["cost"], 0.25);

        let StreamEvent::Terminal(terminal) = rx.recv().await.unwrap() else {
            panic!("expected terminal event");
        };
        let json = serde_json::to_value(&terminal).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["session_id"], session.session_id.to_string());
        assert_eq!(json["elapsed_ms"], 120);
        assert_eq!(json["cost"], 0.25);
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let session = session();
        let (mut publisher, rx) = EventPublisher::channel(session.session_id);
        drop(rx);

        publisher.publish_tier(&session, Vec::new());
        assert!(publisher.is_disconnected());
        assert_eq!(
            publisher.send(StreamEvent::Tier(TierEvent {
                status: "tier_2_complete".to_string(),
                session_id: session.session_id,
                tier: 2,
                fields: BTreeMap::new(),
                deltas: Vec::new(),
                succeeded_count: 0,
                attempted_count: 0,
                from_cache: false,
                elapsed_ms: 0,
                cost: 0.0,
            })),
            Err(ProtocolError::ClientDisconnected)
        );
    }

    #[tokio::test]
    async fn test_sse_stream_ends_after_terminal_event() {
        let session = session();
        let (mut publisher, rx) = EventPublisher::channel(session.session_id);

        publisher.publish_tier(&session, Vec::new());
        publisher.publish_terminal(TerminalKind::Timeout, &session, Some("deadline_exceeded"));
        // Anything after the terminal event is not delivered
        publisher.publish_tier(&session, Vec::new());
        drop(publisher);

        let events: Vec<_> = sse_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_terminal_event_names() {
        let session = session();
        let event = StreamEvent::Terminal(TerminalEvent {
            session_id: session.session_id,
            kind: TerminalKind::Error,
            status: "error".to_string(),
            reason: Some("tier computation panicked".to_string()),
            error_kind: Some("internal".to_string()),
            field_count: 0,
            elapsed_ms: 5,
            cost: 0.0,
        });
        assert_eq!(event.name(), "error");
        assert!(event.is_terminal());
        assert!(event.to_sse().is_ok());
    }
}
