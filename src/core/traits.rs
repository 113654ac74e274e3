//! DI "Interfaces"

use crate::core::assistant::ChatMessage;
use crate::error::Result;
use crate::infrastructure::documents::UploadedDocument;
use crate::infrastructure::entities;
use crate::infrastructure::entities::MessageRole;
use crate::infrastructure::traits::FragmentStream;
use async_trait::async_trait;

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Lists all conversations, oldest first.
    async fn list_conversations(&self) -> Result<Vec<entities::Conversation>>;

    /// Creates a new conversation with an empty transcript and no index.
    async fn create_conversation(&self, title: &str, subject: &str)
    -> Result<entities::Conversation>;

    /// Returns `Err(ConversationNotFound)` if the conversation does not exist.
    async fn get_conversation(&self, conversation_id: i64) -> Result<entities::Conversation>;

    /// Deletes a conversation and its whole transcript, returning what was deleted.
    ///
    /// Returns `Err(ConversationNotFound)` if the conversation did not exist.
    async fn delete_conversation(&self, conversation_id: i64) -> Result<entities::Conversation>;

    /// Points the conversation at a freshly built document index.
    async fn attach_index(&self, conversation_id: i64, handle: &str) -> Result<()>;

    /// List all messages in a conversation, in the order they were appended.
    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<entities::Message>>;

    /// Appends a message to a conversation.
    ///
    /// The helper functions `create_X_message` should be used instead for clarity.
    async fn create_raw_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: String,
    ) -> Result<entities::Message>;

    /// Appends the student's question.
    async fn create_user_message(
        &self,
        conversation_id: i64,
        message: String,
    ) -> Result<entities::Message> {
        self.create_raw_message(conversation_id, MessageRole::User, message)
            .await
    }

    /// Appends a complete tutor answer.
    async fn create_assistant_message(
        &self,
        conversation_id: i64,
        message: String,
    ) -> Result<entities::Message> {
        self.create_raw_message(conversation_id, MessageRole::Assistant, message)
            .await
    }
}

#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    /// Extracts, chunks and embeds `documents` and persists them as the
    /// conversation's index, replacing any previous one.
    ///
    /// At most [`MAX_DOCUMENTS`](crate::config::MAX_DOCUMENTS) documents are
    /// used. Any unreadable document fails the whole build. Returns the index
    /// handle.
    async fn build_index(
        &self,
        conversation_id: i64,
        documents: Vec<UploadedDocument>,
    ) -> Result<String>;

    /// Removes everything stored on disk for the conversation.
    async fn remove_index(&self, conversation_id: i64) -> Result<()>;
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Returns the `k` chunks most similar to `query`, joined by blank lines.
    ///
    /// Without an index handle the context is empty.
    async fn retrieve(&self, query: &str, handle: Option<&str>, k: usize) -> Result<String>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Starts streaming an answer to `prompt`, with `history` replayed before it.
    async fn stream(
        &self,
        persona: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<FragmentStream>;
}
