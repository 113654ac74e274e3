//! Infrastructure traits, used for DI on higher levels

use crate::core::assistant::ChatMessage;
use crate::error::Result;
use crate::infrastructure::entities;
use crate::infrastructure::entities::MessageRole;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Text fragments of a generated answer, in emission order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<entities::Conversation>>;

    async fn create_conversation(
        &self,
        title: &str,
        subject: &str,
    ) -> Result<entities::Conversation>;

    async fn get_conversation(&self, conversation_id: i64)
    -> Result<Option<entities::Conversation>>;

    /// Returns `false` if the conversation does not exist.
    async fn set_vector_path(&self, conversation_id: i64, vector_path: Option<&str>)
    -> Result<bool>;

    /// Deletes the conversation and all of its messages in one transaction.
    ///
    /// Returns `false` if the conversation does not exist.
    async fn delete_conversation(&self, conversation_id: i64) -> Result<bool>;

    async fn list_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<entities::Message>>;

    /// Returns `None` if the conversation does not exist.
    async fn create_message_in_conversation(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Option<entities::Message>>;
}

/// Hosted chat-completion model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// Opens a streamed completion for `messages`.
    ///
    /// An `Err` here means the request never started; errors after that arrive as stream items.
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream>;
}

/// Maps text onto fixed-dimensionality vectors. Must be deterministic.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
