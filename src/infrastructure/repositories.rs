//! DB Repository abstractions

use crate::error::Result;
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{Conversation, Message, MessageRole};
use crate::infrastructure::traits::ConversationRepository;
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::debug;

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbConversationRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations = sqlx::query_as("SELECT * FROM conversations ORDER BY id ASC")
            .fetch_all(&**self.connection)
            .await?;

        Ok(conversations)
    }

    async fn create_conversation(&self, title: &str, subject: &str) -> Result<Conversation> {
        let conversation = sqlx::query_as(
            "INSERT INTO conversations (title, subject, vector_path, created_at) VALUES (?, ?, NULL, ?) RETURNING *",
        )
        .bind(title)
        .bind(subject)
        .bind(Utc::now())
        .fetch_one(&**self.connection)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: i64) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&**self.connection)
            .await?;

        Ok(conversation)
    }

    async fn set_vector_path(
        &self,
        conversation_id: i64,
        vector_path: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE conversations SET vector_path = ? WHERE id = ?")
            .bind(vector_path)
            .bind(conversation_id)
            .execute(&**self.connection)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<bool> {
        let mut tx = self.connection.begin().await?;

        let messages = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        let conversations = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            "deleted conversation {conversation_id} ({} messages)",
            messages.rows_affected()
        );

        Ok(conversations.rows_affected() > 0)
    }

    async fn list_conversation_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await?;

        Ok(messages)
    }

    async fn create_message_in_conversation(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Option<Message>> {
        // The existence check rides along with the insert, so an unknown id is
        // reported as missing rather than as a foreign key violation.
        let message = sqlx::query_as(
            "INSERT INTO messages (conversation_id, role, content, created_at) SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?) RETURNING *",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now())
        .bind(conversation_id)
        .fetch_optional(&**self.connection)
        .await?;

        Ok(message)
    }
}
