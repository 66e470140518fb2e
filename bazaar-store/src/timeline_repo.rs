use async_trait::async_trait;
use bazaar_core::{Actor, CoreError};
use bazaar_order::timeline::{Note, TimelineEvent, TimelineRepository};
use bazaar_shared::OrderId;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    order_id: Uuid,
    kind: String,
    actor: String,
    at: DateTime<Utc>,
    message: String,
    meta: serde_json::Value,
    idempotency_key: Option<String>,
}

impl TryFrom<EventRow> for TimelineEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(TimelineEvent {
            id: row.id,
            order_id: OrderId(row.order_id),
            kind: row.kind.parse()?,
            actor: row.actor.parse::<Actor>().map_err(CoreError::Storage)?,
            at: row.at,
            message: row.message,
            meta: row.meta,
            idempotency_key: row.idempotency_key,
        })
    }
}

#[derive(FromRow)]
struct NoteRow {
    id: Uuid,
    order_id: Uuid,
    author: String,
    at: DateTime<Utc>,
    body: String,
}

impl TryFrom<NoteRow> for Note {
    type Error = CoreError;

    fn try_from(row: NoteRow) -> Result<Self, Self::Error> {
        Ok(Note {
            id: row.id,
            order_id: OrderId(row.order_id),
            author: row.author.parse::<Actor>().map_err(CoreError::Storage)?,
            at: row.at,
            body: row.body,
        })
    }
}

/// Both timeline streams in Postgres, insert-only.
#[derive(Clone)]
pub struct PgTimelineRepository {
    pool: PgPool,
}

impl PgTimelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimelineRepository for PgTimelineRepository {
    async fn append_event(&self, event: &TimelineEvent) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO timeline_events (id, order_id, kind, actor, at, message, meta, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id)
        .bind(event.order_id.0)
        .bind(event.kind.as_str())
        .bind(event.actor.to_string())
        .bind(event.at)
        .bind(&event.message)
        .bind(&event.meta)
        .bind(event.idempotency_key.as_deref())
        .execute(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        Ok(())
    }

    async fn events(&self, order_id: OrderId) -> Result<Vec<TimelineEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, order_id, kind, actor, at, message, meta, idempotency_key \
             FROM timeline_events WHERE order_id = $1 ORDER BY at, id",
        )
        .bind(order_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        rows.into_iter().map(TimelineEvent::try_from).collect()
    }

    async fn append_note(&self, note: &Note) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO order_notes (id, order_id, author, at, body) VALUES ($1, $2, $3, $4, $5)")
            .bind(note.id)
            .bind(note.order_id.0)
            .bind(note.author.to_string())
            .bind(note.at)
            .bind(&note.body)
            .execute(&self.pool)
            .await
            .map_err(CoreError::storage)?;
        Ok(())
    }

    async fn notes(&self, order_id: OrderId) -> Result<Vec<Note>, CoreError> {
        let rows = sqlx::query_as::<_, NoteRow>(
            "SELECT id, order_id, author, at, body FROM order_notes WHERE order_id = $1 ORDER BY at, id",
        )
        .bind(order_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::storage)?;
        rows.into_iter().map(Note::try_from).collect()
    }
}
