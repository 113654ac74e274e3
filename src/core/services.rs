//! Implementations for the service the app needs.
//!

use crate::core::traits::ConversationService;
use crate::error::{Error, Result};
use crate::infrastructure::entities::{Conversation, Message, MessageRole};
use crate::infrastructure::traits::ConversationRepository;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::info;

#[injectable(ConversationService)]
pub struct DbConversationService {
    repo: Ref<dyn ConversationRepository>,
}

impl DbConversationService {
    pub fn new(repo: Ref<dyn ConversationRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ConversationService for DbConversationService {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.repo.list_conversations().await
    }

    async fn create_conversation(&self, title: &str, subject: &str) -> Result<Conversation> {
        let conversation = self.repo.create_conversation(title, subject).await?;
        info!(
            "Created conversation {} ({:?}, subject {:?}).",
            conversation.id, conversation.title, conversation.subject
        );

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: i64) -> Result<Conversation> {
        self.repo
            .get_conversation(conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id).await?;

        if !self.repo.delete_conversation(conversation_id).await? {
            return Err(Error::ConversationNotFound(conversation_id));
        }
        info!("Deleted conversation {conversation_id}.");

        Ok(conversation)
    }

    async fn attach_index(&self, conversation_id: i64, handle: &str) -> Result<()> {
        if self
            .repo
            .set_vector_path(conversation_id, Some(handle))
            .await?
        {
            Ok(())
        } else {
            Err(Error::ConversationNotFound(conversation_id))
        }
    }

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        // An empty transcript and a missing conversation look the same to the
        // repository.
        self.get_conversation(conversation_id).await?;
        self.repo.list_conversation_messages(conversation_id).await
    }

    async fn create_raw_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: String,
    ) -> Result<Message> {
        self.repo
            .create_message_in_conversation(conversation_id, role, &content)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))
    }
}
