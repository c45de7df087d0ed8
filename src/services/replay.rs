//! Replay: fetch an epic's event history and play it back with timing.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::adapters::sqlite::event_log::{EventFilter, EventLog};
use crate::domain::errors::DomainResult;
use crate::domain::models::event::Event;

/// Playback speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaySpeed {
    #[default]
    OneX,
    TwoX,
    Instant,
}

impl ReplaySpeed {
    fn divisor(self) -> u64 {
        match self {
            Self::OneX => 1,
            Self::TwoX => 2,
            Self::Instant => 0,
        }
    }
}

/// An event annotated with the gap to its predecessor.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub event: Event,
    pub delta_ms: i64,
}

/// AND-of-criteria filter for replay streams.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    pub kinds: Vec<String>,
    pub agent: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Replay {
    log: EventLog,
}

impl Replay {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Events concerning an epic and its children, sorted by timestamp
    /// and annotated with inter-event deltas.
    pub async fn fetch_epic_events(
        &self,
        project_key: &str,
        epic_id: &str,
    ) -> DomainResult<Vec<TimedEvent>> {
        let children: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM cells WHERE parent_id = ?")
                .bind(epic_id)
                .fetch_all(self.log.pool())
                .await?;
        let mut scope: HashSet<String> = children.into_iter().map(|(id,)| id).collect();
        scope.insert(epic_id.to_string());

        let events = self
            .log
            .read(&EventFilter::new().project_key(project_key))
            .await?;
        let mut scoped: Vec<Event> = events
            .into_iter()
            .filter(|event| {
                event
                    .entity_id
                    .as_ref()
                    .is_some_and(|entity| scope.contains(entity))
            })
            .collect();
        scoped.sort_by_key(Event::timestamp_ms);

        Ok(annotate(scoped))
    }

    /// Filter a timed stream; deltas are recomputed so pacing follows the
    /// surviving events' own gaps.
    pub fn filter_events(&self, events: Vec<TimedEvent>, filter: &ReplayFilter) -> Vec<TimedEvent> {
        let survivors: Vec<Event> = events
            .into_iter()
            .map(|timed| timed.event)
            .filter(|event| {
                if !filter.kinds.is_empty() && !filter.kinds.iter().any(|k| k == event.kind()) {
                    return false;
                }
                if let Some(agent) = &filter.agent {
                    if !event_mentions_agent(event, agent) {
                        return false;
                    }
                }
                if let Some(from) = filter.from {
                    if event.timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = filter.to {
                    if event.timestamp > to {
                        return false;
                    }
                }
                true
            })
            .collect();
        annotate(survivors)
    }

    /// Lazy, restartable playback producer.
    pub fn replay_with_timing(&self, events: Vec<TimedEvent>, speed: ReplaySpeed) -> ReplayPlayer {
        ReplayPlayer {
            events,
            position: 0,
            speed,
        }
    }
}

/// Paced event producer. `next` sleeps each event's delta (scaled by the
/// speed) before yielding it; `Instant` suppresses all waits.
#[derive(Debug)]
pub struct ReplayPlayer {
    events: Vec<TimedEvent>,
    position: usize,
    speed: ReplaySpeed,
}

impl ReplayPlayer {
    pub async fn next(&mut self) -> Option<TimedEvent> {
        let timed = self.events.get(self.position)?.clone();
        self.position += 1;
        let divisor = self.speed.divisor();
        if divisor > 0 && timed.delta_ms > 0 {
            let wait_ms = (timed.delta_ms.max(0) as u64) / divisor;
            if wait_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
            }
        }
        Some(timed)
    }

    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn remaining(&self) -> usize {
        self.events.len().saturating_sub(self.position)
    }
}

fn annotate(events: Vec<Event>) -> Vec<TimedEvent> {
    let mut annotated = Vec::with_capacity(events.len());
    let mut previous: Option<i64> = None;
    for event in events {
        let ts = event.timestamp_ms();
        let delta_ms = previous.map_or(0, |prev| (ts - prev).max(0));
        previous = Some(ts);
        annotated.push(TimedEvent { event, delta_ms });
    }
    annotated
}

/// Does the event name this agent in any of its payload roles?
fn event_mentions_agent(event: &Event, agent: &str) -> bool {
    use crate::domain::models::event::EventPayload as P;
    match &event.payload {
        P::AgentRegistered { agent: a, .. }
        | P::AgentSessionEnded { agent: a }
        | P::MessageAcked { agent: a, .. }
        | P::FileReserved { agent: a, .. }
        | P::FileReleased { agent: a, .. }
        | P::CheckpointSaved { agent: a, .. }
        | P::EpicDecomposed { agent: a, .. }
        | P::OutcomeRecorded { agent: a, .. }
        | P::ContextCompacted { agent: a, .. } => a == agent,
        P::MessageSent { from, to, .. } => from == agent || to.iter().any(|t| t == agent),
        P::MessageRead { reader, .. } => reader == agent,
        P::FileConflict {
            requesting_agent,
            holders,
            ..
        } => requesting_agent == agent || holders.iter().any(|h| h == agent),
        P::FeedbackRecorded {
            agent: a,
            target_agent,
            ..
        } => a == agent || target_agent.as_deref() == Some(agent),
        P::CellCommentAdded { author, .. } => author == agent,
        P::ValidationRecorded { validator, .. } => validator == agent,
        P::CellCreated { assignee, .. } | P::CellUpdated { assignee, .. } => {
            assignee.as_deref() == Some(agent)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_computes_deltas_from_predecessors() {
        use crate::domain::models::event::{EventPayload, EventStream};
        let base = Utc::now();
        let make = |offset_ms: i64, label: &str| Event {
            id: offset_ms,
            sequence: offset_ms,
            stream: EventStream::Session,
            project_key: "/p".into(),
            entity_id: Some("swift-otter".into()),
            timestamp: base + chrono::Duration::milliseconds(offset_ms),
            payload: EventPayload::CheckpointSaved {
                agent: "swift-otter".into(),
                label: label.into(),
                data: serde_json::json!({}),
            },
        };
        let timed = annotate(vec![make(0, "a"), make(40, "b"), make(100, "c")]);
        let deltas: Vec<i64> = timed.iter().map(|t| t.delta_ms).collect();
        assert_eq!(deltas, vec![0, 40, 60]);
    }
}
