//! Per-order audit trail.
//!
//! System-generated events and human notes are kept in separate append-only
//! streams and merged at read time. An event recorded again under an
//! idempotency key it already carries is not written twice; the merged read
//! also drops rows sharing a key or an id. Keyless events are never treated
//! as retries of one another.

use async_trait::async_trait;
use bazaar_core::{Actor, Clock, CoreError, CoreResult};
use bazaar_shared::OrderId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    OrderCreated,
    FulfillmentMarked,
    EarningsHeld,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineKind::OrderCreated => "order_created",
            TimelineKind::FulfillmentMarked => "fulfillment_marked",
            TimelineKind::EarningsHeld => "earnings_held",
        }
    }
}

impl std::str::FromStr for TimelineKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order_created" => Ok(TimelineKind::OrderCreated),
            "fulfillment_marked" => Ok(TimelineKind::FulfillmentMarked),
            "earnings_held" => Ok(TimelineKind::EarningsHeld),
            other => Err(CoreError::Storage(format!("unknown timeline kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub id: Uuid,
    pub order_id: OrderId,
    pub kind: TimelineKind,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: Uuid,
    pub order_id: OrderId,
    pub author: Actor,
    pub at: DateTime<Utc>,
    pub body: String,
}

/// One row of the merged read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum TimelineEntry {
    Event(TimelineEvent),
    Note(Note),
}

impl TimelineEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Event(e) => e.at,
            TimelineEntry::Note(n) => n.at,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            TimelineEntry::Event(e) => e.order_id,
            TimelineEntry::Note(n) => n.order_id,
        }
    }
}

#[async_trait]
pub trait TimelineRepository: Send + Sync {
    async fn append_event(&self, event: &TimelineEvent) -> Result<(), CoreError>;
    async fn events(&self, order_id: OrderId) -> Result<Vec<TimelineEvent>, CoreError>;
    async fn append_note(&self, note: &Note) -> Result<(), CoreError>;
    async fn notes(&self, order_id: OrderId) -> Result<Vec<Note>, CoreError>;
}

#[derive(Default)]
pub struct InMemoryTimeline {
    events: RwLock<HashMap<OrderId, Vec<TimelineEvent>>>,
    notes: RwLock<HashMap<OrderId, Vec<Note>>>,
}

impl InMemoryTimeline {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimelineRepository for InMemoryTimeline {
    async fn append_event(&self, event: &TimelineEvent) -> Result<(), CoreError> {
        self.events
            .write()
            .await
            .entry(event.order_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events(&self, order_id: OrderId) -> Result<Vec<TimelineEvent>, CoreError> {
        Ok(self.events.read().await.get(&order_id).cloned().unwrap_or_default())
    }

    async fn append_note(&self, note: &Note) -> Result<(), CoreError> {
        self.notes
            .write()
            .await
            .entry(note.order_id)
            .or_default()
            .push(note.clone());
        Ok(())
    }

    async fn notes(&self, order_id: OrderId) -> Result<Vec<Note>, CoreError> {
        Ok(self.notes.read().await.get(&order_id).cloned().unwrap_or_default())
    }
}

/// A timeline event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewTimelineEvent {
    pub order_id: OrderId,
    pub kind: TimelineKind,
    pub actor: Actor,
    pub message: String,
    pub meta: serde_json::Value,
    pub idempotency_key: Option<String>,
}

type OrderSlot = Arc<Mutex<Option<DateTime<Utc>>>>;

pub struct Timeline {
    repo: Arc<dyn TimelineRepository>,
    clock: Arc<dyn Clock>,
    /// Writers of one order queue on its slot, which remembers the last
    /// instant handed out. Idle slots are dropped.
    slots: Mutex<HashMap<OrderId, OrderSlot>>,
    updates: broadcast::Sender<TimelineEntry>,
}

impl Timeline {
    pub fn new(repo: Arc<dyn TimelineRepository>, clock: Arc<dyn Clock>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            repo,
            clock,
            slots: Mutex::new(HashMap::new()),
            updates,
        }
    }

    /// Live feed of every appended event and note, across orders.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEntry> {
        self.updates.subscribe()
    }

    /// Append an event. When `idempotency_key` is set and the order already
    /// has an event with that key, the stored event is returned instead.
    pub async fn record(&self, new: NewTimelineEvent) -> CoreResult<TimelineEvent> {
        let order_id = new.order_id;
        let slot = self.slot(order_id).await;
        let result = self.record_in(&slot, new).await;
        self.release(order_id, slot).await;

        let (event, fresh) = result?;
        if fresh {
            debug!(order_id = %event.order_id, kind = event.kind.as_str(), "timeline event recorded");
            // No subscribers is fine.
            let _ = self.updates.send(TimelineEntry::Event(event.clone()));
        }
        Ok(event)
    }

    async fn record_in(&self, slot: &OrderSlot, new: NewTimelineEvent) -> CoreResult<(TimelineEvent, bool)> {
        let mut last_at = slot.lock().await;
        if let Some(key) = &new.idempotency_key {
            let existing = self.repo.events(new.order_id).await?;
            if let Some(event) = existing.into_iter().find(|e| e.idempotency_key.as_ref() == Some(key)) {
                debug!(order_id = %new.order_id, %key, "timeline event already recorded");
                return Ok((event, false));
            }
        }

        let at = self.next_instant(*last_at, new.order_id).await?;
        let event = TimelineEvent {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            kind: new.kind,
            actor: new.actor,
            at,
            message: new.message,
            meta: new.meta,
            idempotency_key: new.idempotency_key,
        };
        self.repo.append_event(&event).await?;
        *last_at = Some(at);
        Ok((event, true))
    }

    pub async fn add_note(&self, order_id: OrderId, author: Actor, body: &str) -> CoreResult<Note> {
        let body = body.trim();
        if body.is_empty() {
            return Err(CoreError::Invalid("note body is empty".into()));
        }
        let slot = self.slot(order_id).await;
        let result = async {
            let mut last_at = slot.lock().await;
            let at = self.next_instant(*last_at, order_id).await?;
            let note = Note {
                id: Uuid::new_v4(),
                order_id,
                author,
                at,
                body: body.to_string(),
            };
            self.repo.append_note(&note).await?;
            *last_at = Some(at);
            Ok::<_, CoreError>(note)
        }
        .await;
        self.release(order_id, slot).await;

        let note = result?;
        let _ = self.updates.send(TimelineEntry::Note(note.clone()));
        Ok(note)
    }

    pub async fn events(&self, order_id: OrderId) -> CoreResult<Vec<TimelineEvent>> {
        self.repo.events(order_id).await
    }

    /// Events and notes in time order, duplicates removed.
    pub async fn merged(&self, order_id: OrderId) -> CoreResult<Vec<TimelineEntry>> {
        let events = self.repo.events(order_id).await?;
        let notes = self.repo.notes(order_id).await?;

        let mut seen = HashSet::new();
        let mut merged: Vec<TimelineEntry> = events
            .into_iter()
            .filter(|event| seen.insert(dedup_key(event)))
            .map(TimelineEntry::Event)
            .chain(notes.into_iter().map(TimelineEntry::Note))
            .collect();
        merged.sort_by_key(|entry| entry.at());
        Ok(merged)
    }

    async fn slot(&self, order_id: OrderId) -> OrderSlot {
        self.slots.lock().await.entry(order_id).or_default().clone()
    }

    async fn release(&self, order_id: OrderId, slot: OrderSlot) {
        let mut slots = self.slots.lock().await;
        // The map and this handle are the only owners.
        if Arc::strong_count(&slot) == 2 && slots.get(&order_id).is_some_and(|held| Arc::ptr_eq(held, &slot)) {
            slots.remove(&order_id);
        }
    }

    #[cfg(test)]
    async fn tracked_orders(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Timestamps within one order are strictly increasing, even when the
    /// clock stands still or steps back.
    async fn next_instant(&self, cached: Option<DateTime<Utc>>, order_id: OrderId) -> CoreResult<DateTime<Utc>> {
        let previous = match cached {
            Some(at) => Some(at),
            None => {
                let events = self.repo.events(order_id).await?;
                let notes = self.repo.notes(order_id).await?;
                events
                    .iter()
                    .map(|e| e.at)
                    .chain(notes.iter().map(|n| n.at))
                    .max()
            }
        };
        let now = self.clock.now();
        Ok(match previous {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        })
    }
}

#[derive(Hash, PartialEq, Eq)]
enum DedupKey {
    Idempotency(String),
    Row(Uuid),
}

/// Rows sharing an idempotency key are one logical event; keyless rows only
/// collapse when storage wrote the same row twice.
fn dedup_key(event: &TimelineEvent) -> DedupKey {
    match &event.idempotency_key {
        Some(key) => DedupKey::Idempotency(key.clone()),
        None => DedupKey::Row(event.id),
    }
}
