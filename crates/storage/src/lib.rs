use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, SqliteConnection, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration as StdDuration,
};

use shared::domain::{
    AssistantConversationId, AssistantMessageId, AssistantRole, ConversationId, MessageId, UserId,
    DEFAULT_ASSISTANT_TITLE,
};

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(10);

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredConversationPreview {
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub peer: StoredUser,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender_id: Option<UserId>,
}

#[derive(Debug, Clone)]
pub struct StoredAssistantConversation {
    pub conversation_id: AssistantConversationId,
    pub user_id: UserId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredAssistantSummary {
    pub conversation: StoredAssistantConversation,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredAssistantMessage {
    pub message_id: AssistantMessageId,
    pub conversation_id: AssistantConversationId,
    pub role: AssistantRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Transaction holding the write lock from its first statement. Bodies that
    /// read before writing must use this; a deferred lock upgrade under
    /// contention fails with `SQLITE_BUSY` without waiting.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn find_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, image FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            image: r.get::<Option<String>, _>(2),
        }))
    }

    pub async fn list_users_except(&self, user_id: UserId) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(
            "SELECT id, username, image FROM users WHERE id <> ? ORDER BY lower(username) ASC, id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredUser {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                image: r.get::<Option<String>, _>(2),
            })
            .collect())
    }

    /// Returns the conversation for the unordered pair `{a, b}`, creating it and
    /// both participant links when none exists. The boolean is `true` only when
    /// this call created the rows.
    pub async fn create_or_get_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(StoredConversation, bool)> {
        if a == b {
            bail!("a conversation needs two distinct participants");
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };

        let mut tx = self.begin_write().await?;
        let inserted = sqlx::query(
            "INSERT INTO conversations (pair_low, pair_high, created_at) VALUES (?, ?, ?)
             ON CONFLICT(pair_low, pair_high) DO NOTHING
             RETURNING id, created_at",
        )
        .bind(low.0)
        .bind(high.0)
        .bind(store_now())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(row) => {
                let conversation = StoredConversation {
                    conversation_id: ConversationId(row.get::<i64, _>(0)),
                    created_at: row.get::<DateTime<Utc>, _>(1),
                };
                for user_id in [low, high] {
                    sqlx::query(
                        "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
                    )
                    .bind(conversation.conversation_id.0)
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
                }
                (conversation, true)
            }
            None => {
                let row = sqlx::query(
                    "SELECT id, created_at FROM conversations WHERE pair_low = ? AND pair_high = ?",
                )
                .bind(low.0)
                .bind(high.0)
                .fetch_one(&mut *tx)
                .await?;
                (
                    StoredConversation {
                        conversation_id: ConversationId(row.get::<i64, _>(0)),
                        created_at: row.get::<DateTime<Utc>, _>(1),
                    },
                    false,
                )
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query("SELECT id, created_at FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredConversation {
            conversation_id: ConversationId(r.get::<i64, _>(0)),
            created_at: r.get::<DateTime<Utc>, _>(1),
        }))
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn list_participants(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    /// Persists a message. The store assigns `created_at`, strictly after the
    /// previous message in the same conversation.
    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<StoredMessage> {
        let mut tx = self.begin_write().await?;
        let created_at = next_message_timestamp(&mut *tx, conversation_id).await?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_user_id, content, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at,
        })
    }

    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_user_id, content, created_at
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                conversation_id: ConversationId(r.get::<i64, _>(1)),
                sender_id: UserId(r.get::<i64, _>(2)),
                content: r.get::<String, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }

    pub async fn count_messages(&self, conversation_id: ConversationId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// One row per conversation the user participates in, joined with the other
    /// participant and the latest message. Unordered; callers sort by activity.
    pub async fn list_conversation_previews(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversationPreview>> {
        let rows = sqlx::query(
            "SELECT c.id, c.created_at, u.id, u.username, u.image, m.content, m.created_at, m.sender_user_id
             FROM conversation_participants me
             INNER JOIN conversations c ON c.id = me.conversation_id
             INNER JOIN conversation_participants other
                ON other.conversation_id = c.id AND other.user_id <> me.user_id
             INNER JOIN users u ON u.id = other.user_id
             LEFT JOIN messages m ON m.id = (
                SELECT latest.id FROM messages latest
                WHERE latest.conversation_id = c.id
                ORDER BY latest.created_at DESC, latest.id DESC
                LIMIT 1
             )
             WHERE me.user_id = ?",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredConversationPreview {
                conversation_id: ConversationId(r.get::<i64, _>(0)),
                created_at: r.get::<DateTime<Utc>, _>(1),
                peer: StoredUser {
                    user_id: UserId(r.get::<i64, _>(2)),
                    username: r.get::<String, _>(3),
                    image: r.get::<Option<String>, _>(4),
                },
                last_message: r.get::<Option<String>, _>(5),
                last_message_time: r.get::<Option<DateTime<Utc>>, _>(6),
                last_message_sender_id: r.get::<Option<i64>, _>(7).map(UserId),
            })
            .collect())
    }

    /// Removes the conversation, its participant links and its messages as one
    /// transaction. Returns the former participants. Nothing is removed when any
    /// step fails.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let mut tx = self.begin_write().await?;

        let participants: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.0)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete conversation messages")?;
        sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete conversation participants")?;
        let removed = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete conversation")?
            .rows_affected();
        if removed == 0 {
            return Err(anyhow!("conversation {} not found", conversation_id.0));
        }

        tx.commit().await?;
        Ok(participants.into_iter().map(UserId).collect())
    }

    pub async fn create_assistant_conversation(
        &self,
        user_id: UserId,
        title: &str,
    ) -> Result<StoredAssistantConversation> {
        let now = store_now();
        let rec = sqlx::query(
            "INSERT INTO assistant_conversations (user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id.0)
        .bind(title)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredAssistantConversation {
            conversation_id: AssistantConversationId(rec.get::<i64, _>(0)),
            user_id,
            title: title.to_string(),
            updated_at: now,
        })
    }

    pub async fn list_assistant_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredAssistantSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.title, c.updated_at, (
                SELECT m.content FROM assistant_messages m
                WHERE m.assistant_conversation_id = c.id
                ORDER BY m.id DESC
                LIMIT 1
             )
             FROM assistant_conversations c
             WHERE c.user_id = ?
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredAssistantSummary {
                conversation: StoredAssistantConversation {
                    conversation_id: AssistantConversationId(r.get::<i64, _>(0)),
                    user_id,
                    title: r.get::<String, _>(1),
                    updated_at: r.get::<DateTime<Utc>, _>(2),
                },
                last_message: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    /// Owner-scoped lookup: another user's conversation reads as absent.
    pub async fn load_assistant_conversation(
        &self,
        user_id: UserId,
        conversation_id: AssistantConversationId,
    ) -> Result<Option<StoredAssistantConversation>> {
        let row = sqlx::query(
            "SELECT id, title, updated_at FROM assistant_conversations WHERE id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredAssistantConversation {
            conversation_id: AssistantConversationId(r.get::<i64, _>(0)),
            user_id,
            title: r.get::<String, _>(1),
            updated_at: r.get::<DateTime<Utc>, _>(2),
        }))
    }

    pub async fn list_assistant_messages(
        &self,
        conversation_id: AssistantConversationId,
    ) -> Result<Vec<StoredAssistantMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, content, created_at
             FROM assistant_messages
             WHERE assistant_conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let role = r.get::<String, _>(1);
                Ok(StoredAssistantMessage {
                    message_id: AssistantMessageId(r.get::<i64, _>(0)),
                    conversation_id,
                    role: AssistantRole::parse(&role)
                        .ok_or_else(|| anyhow!("unknown assistant role '{role}'"))?,
                    content: r.get::<String, _>(2),
                    created_at: r.get::<DateTime<Utc>, _>(3),
                })
            })
            .collect()
    }

    pub async fn rename_assistant_conversation(
        &self,
        user_id: UserId,
        conversation_id: AssistantConversationId,
        title: &str,
    ) -> Result<Option<StoredAssistantConversation>> {
        let row = sqlx::query(
            "UPDATE assistant_conversations SET title = ?, updated_at = ?
             WHERE id = ? AND user_id = ?
             RETURNING id, title, updated_at",
        )
        .bind(title)
        .bind(store_now())
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredAssistantConversation {
            conversation_id: AssistantConversationId(r.get::<i64, _>(0)),
            user_id,
            title: r.get::<String, _>(1),
            updated_at: r.get::<DateTime<Utc>, _>(2),
        }))
    }

    pub async fn delete_assistant_conversation(
        &self,
        user_id: UserId,
        conversation_id: AssistantConversationId,
    ) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM assistant_conversations WHERE id = ? AND user_id = ?")
            .bind(conversation_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Stores one user turn and the assistant reply together and bumps the
    /// conversation's `updated_at`. A conversation still carrying the default
    /// title and no prior turns is renamed to `first_turn_title`.
    pub async fn append_assistant_exchange(
        &self,
        conversation_id: AssistantConversationId,
        user_content: &str,
        assistant_content: &str,
        first_turn_title: &str,
    ) -> Result<(StoredAssistantMessage, StoredAssistantMessage)> {
        let mut tx = self.begin_write().await?;

        let title: String =
            sqlx::query_scalar("SELECT title FROM assistant_conversations WHERE id = ?")
                .bind(conversation_id.0)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| anyhow!("assistant conversation {} not found", conversation_id.0))?;
        let prior_turns: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assistant_messages WHERE assistant_conversation_id = ?",
        )
        .bind(conversation_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let user_at = store_now();
        let assistant_at = user_at + Duration::milliseconds(1);
        let mut stored = Vec::with_capacity(2);
        for (role, content, created_at) in [
            (AssistantRole::User, user_content, user_at),
            (AssistantRole::Assistant, assistant_content, assistant_at),
        ] {
            let rec = sqlx::query(
                "INSERT INTO assistant_messages (assistant_conversation_id, role, content, created_at) VALUES (?, ?, ?, ?) RETURNING id",
            )
            .bind(conversation_id.0)
            .bind(role.as_str())
            .bind(content)
            .bind(created_at)
            .fetch_one(&mut *tx)
            .await?;
            stored.push(StoredAssistantMessage {
                message_id: AssistantMessageId(rec.get::<i64, _>(0)),
                conversation_id,
                role,
                content: content.to_string(),
                created_at,
            });
        }

        let next_title = if prior_turns == 0 && title == DEFAULT_ASSISTANT_TITLE {
            first_turn_title.to_string()
        } else {
            title
        };
        sqlx::query("UPDATE assistant_conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(next_title)
            .bind(assistant_at)
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        let assistant = stored.pop().ok_or_else(|| anyhow!("missing assistant turn"))?;
        let user = stored.pop().ok_or_else(|| anyhow!("missing user turn"))?;
        Ok((user, assistant))
    }
}

fn store_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

async fn next_message_timestamp(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> Result<DateTime<Utc>> {
    let last: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT created_at FROM messages WHERE conversation_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(conversation_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(monotonic_after(store_now(), last))
}

fn monotonic_after(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(last) if now <= last => last + Duration::milliseconds(1),
        _ => now,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
