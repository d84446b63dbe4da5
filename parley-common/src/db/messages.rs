//! SQLite-backed message store

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::events::{EventBus, ParleyEvent};
use crate::message::{Message, MessageContent, MessageStatus};
use crate::owner::{AnonymousId, OwnerFilter, OwnerRef, UserId};
use crate::store::{InsertFeed, MergeOutcome, MergeRecord, MessageStore};
use crate::{Error, Result};

/// Fixed-width RFC 3339 so lexical order in SQL equals time order
fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("Invalid timestamp '{}': {}", raw, e)))
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    bus: EventBus,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let id: String = row.try_get("id")?;
        let owner_kind: String = row.try_get("owner_kind")?;
        let owner_id: String = row.try_get("owner_id")?;
        let content: String = row.try_get("content")?;
        let status: String = row.try_get("status")?;
        let handle: Option<String> = row.try_get("correlation_handle")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Message {
            id: id.parse()?,
            owner: OwnerRef::from_parts(&owner_kind, &owner_id)?,
            content: serde_json::from_str::<MessageContent>(&content)?,
            status: status.parse::<MessageStatus>()?,
            created_at: decode_timestamp(&created_at)?,
            handle: handle.map(|h| h.parse()).transpose()?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn select(&self, filter: &OwnerFilter) -> Result<Vec<Message>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, owner_kind, owner_id, content, status, correlation_handle, created_at FROM messages WHERE ",
        );
        for (i, owner) in filter.owners().iter().enumerate() {
            if i > 0 {
                query.push(" OR ");
            }
            query
                .push("(owner_kind = ")
                .push_bind(owner.kind_str())
                .push(" AND owner_id = ")
                .push_bind(owner.id_string())
                .push(")");
        }
        query.push(" ORDER BY created_at ASC, seq ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn subscribe(&self, filter: OwnerFilter) -> Result<InsertFeed> {
        Ok(InsertFeed::new(self.bus.subscribe(), filter))
    }

    async fn insert(&self, message: Message) -> Result<()> {
        message.validate()?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, owner_kind, owner_id, kind, content, status, correlation_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.owner.kind_str())
        .bind(message.owner.id_string())
        .bind(message.kind().as_str())
        .bind(serde_json::to_string(&message.content)?)
        .bind(message.status.as_str())
        .bind(message.handle.map(|h| h.to_string()))
        .bind(encode_timestamp(&message.created_at))
        .execute(&self.pool)
        .await?;

        debug!(message_id = %message.id, owner = %message.owner, kind = message.kind().as_str(), "Inserted message");
        self.bus.emit_lossy(ParleyEvent::MessageInserted {
            message,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn find_merge(&self, anonymous_id: &AnonymousId) -> Result<Option<MergeRecord>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT user_id, merged_at FROM session_merges WHERE anonymous_id = ?",
        )
        .bind(anonymous_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(user_id, merged_at)| {
            Ok(MergeRecord {
                anonymous_id: *anonymous_id,
                user_id: UserId::new(user_id)?,
                merged_at: decode_timestamp(&merged_at)?,
            })
        })
        .transpose()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn reassign_ownership(
        &self,
        anonymous_id: &AnonymousId,
        user_id: &UserId,
    ) -> Result<MergeOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claim the merge record first; a losing concurrent attempt sees 0 rows
        let claimed = sqlx::query(
            r#"
            INSERT INTO session_merges (anonymous_id, user_id, merged_at)
            VALUES (?, ?, ?)
            ON CONFLICT(anonymous_id) DO NOTHING
            "#,
        )
        .bind(anonymous_id.to_string())
        .bind(user_id.as_str())
        .bind(encode_timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            let existing: String =
                sqlx::query_scalar("SELECT user_id FROM session_merges WHERE anonymous_id = ?")
                    .bind(anonymous_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(MergeOutcome::AlreadyMerged {
                user_id: UserId::new(existing)?,
            });
        }

        let moved = sqlx::query(
            r#"
            UPDATE messages
            SET owner_kind = 'user', owner_id = ?
            WHERE owner_kind = 'anonymous' AND owner_id = ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(anonymous_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(%anonymous_id, %user_id, moved, "Reassigned anonymous history");
        self.bus.emit_lossy(ParleyEvent::OwnershipReassigned {
            anonymous_id: *anonymous_id,
            user_id: user_id.clone(),
            moved,
            timestamp: Utc::now(),
        });
        Ok(MergeOutcome::Merged { moved })
    }
}
