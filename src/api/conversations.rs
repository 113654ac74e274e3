//! Conversations endpoints

use crate::api::UploadForm;
use crate::api::conversations::schemas::{
    AskQuery, ConversationHistory, ConversationSummary, DocumentsIndexed, Status,
};
use crate::config::Settings;
use crate::core::assistant::{ChatMessage, PERSONA, compose_prompt, relay_answer};
use crate::core::traits::{AnswerGenerator, ContextRetriever, ConversationService, DocumentIndexer};
use crate::error::{Error, Result};
use async_stream::stream;
use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use di_axum::Inject;
use log::{error, info, warn};

/// Returned in place of an index handle when a conversation has no documents.
pub const NO_DOCUMENTS: &str = "No PDFs uploaded";

pub fn router() -> Router {
    Router::new()
        .route("/create", post(create_conversation))
        .route("/:conversation_id/get", get(ask_question))
        .route("/:conversation_id/delete", delete(delete_conversation))
        .route("/:conversation_id/documents", post(replace_documents))
        .route("/history/:conversation_id", get(conversation_history))
        .route("/historys/", get(list_conversations))
}

async fn create_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(indexer): Inject<dyn DocumentIndexer>,
    form: UploadForm,
) -> Result<Json<DocumentsIndexed>> {
    let title = form.required("title")?;
    let subject = form.required("subject")?;

    let conversation = conversation_service
        .create_conversation(&title, &subject)
        .await?;

    if form.documents.is_empty() {
        return Ok(Json(DocumentsIndexed {
            conversation_id: conversation.id,
            vector_path: NO_DOCUMENTS.to_owned(),
        }));
    }

    let indexed = match indexer.build_index(conversation.id, form.documents).await {
        Ok(handle) => conversation_service
            .attach_index(conversation.id, &handle)
            .await
            .map(|_| handle),
        Err(e) => Err(e),
    };

    match indexed {
        Ok(vector_path) => Ok(Json(DocumentsIndexed {
            conversation_id: conversation.id,
            vector_path,
        })),
        Err(e) => {
            warn!(
                "Indexing failed for new conversation {}, rolling back: {e}",
                conversation.id
            );
            if let Err(cleanup) = conversation_service
                .delete_conversation(conversation.id)
                .await
            {
                error!("Rollback of conversation {} failed: {cleanup}", conversation.id);
            }
            if let Err(cleanup) = indexer.remove_index(conversation.id).await {
                error!(
                    "Cleanup of documents for conversation {} failed: {cleanup}",
                    conversation.id
                );
            }
            Err(e)
        }
    }
}

async fn ask_question(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(retriever): Inject<dyn ContextRetriever>,
    Inject(generator): Inject<dyn AnswerGenerator>,
    Inject(settings): Inject<Settings>,
    Path(conversation_id): Path<i64>,
    Query(AskQuery { query }): Query<AskQuery>,
) -> Result<Response> {
    if query.trim().is_empty() {
        return Err(Error::InvalidRequest("query must not be empty".into()));
    }

    let conversation = conversation_service
        .get_conversation(conversation_id)
        .await?;

    let history: Vec<ChatMessage> = conversation_service
        .list_messages(conversation_id)
        .await?
        .into_iter()
        .map(ChatMessage::from)
        .collect();

    let context = retriever
        .retrieve(
            &query,
            conversation.vector_path.as_deref(),
            settings.retrieval_top_k,
        )
        .await?;
    let prompt = compose_prompt(&conversation.subject, &context, &query)?;

    // The question only joins the transcript once the model has accepted the request.
    let fragments = generator.stream(PERSONA, &history, &prompt).await?;
    conversation_service
        .create_user_message(conversation_id, query)
        .await?;

    info!(
        "Answering in conversation {conversation_id} ({} prior messages, {} characters of context).",
        history.len(),
        context.len()
    );

    let mut receiver = relay_answer(fragments, conversation_service, conversation_id);
    let body = stream! {
        while let Some(fragment) = receiver.recv().await {
            yield fragment;
        }
    };

    Ok((
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn delete_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(indexer): Inject<dyn DocumentIndexer>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Status>> {
    conversation_service
        .delete_conversation(conversation_id)
        .await?;

    if let Err(e) = indexer.remove_index(conversation_id).await {
        warn!("Stored documents of deleted conversation {conversation_id} were not removed: {e}");
    }

    Ok(Json(Status {
        status: "deleted".to_owned(),
    }))
}

async fn replace_documents(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(indexer): Inject<dyn DocumentIndexer>,
    Path(conversation_id): Path<i64>,
    form: UploadForm,
) -> Result<Json<DocumentsIndexed>> {
    conversation_service
        .get_conversation(conversation_id)
        .await?;

    if form.documents.is_empty() {
        return Err(Error::InvalidRequest("at least one file is required".into()));
    }

    let vector_path = indexer
        .build_index(conversation_id, form.documents)
        .await?;
    conversation_service
        .attach_index(conversation_id, &vector_path)
        .await?;

    Ok(Json(DocumentsIndexed {
        conversation_id,
        vector_path,
    }))
}

async fn conversation_history(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationHistory>> {
    let conversation = conversation_service
        .get_conversation(conversation_id)
        .await?;
    let messages = conversation_service.list_messages(conversation_id).await?;

    Ok(Json(ConversationHistory {
        conversation_id: conversation.id,
        title: conversation.title,
        subject: conversation.subject,
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn list_conversations(
    Inject(conversation_service): Inject<dyn ConversationService>,
) -> Result<Json<Vec<ConversationSummary>>> {
    let conversations = conversation_service.list_conversations().await?;

    Ok(Json(
        conversations
            .into_iter()
            .map(ConversationSummary::from)
            .collect(),
    ))
}

pub mod schemas {
    use crate::infrastructure::entities;
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug)]
    pub struct AskQuery {
        pub query: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct DocumentsIndexed {
        pub conversation_id: i64,
        pub vector_path: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Status {
        pub status: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct ConversationSummary {
        pub conversation_id: i64,
        pub title: String,
        pub subject: String,
    }

    impl From<entities::Conversation> for ConversationSummary {
        fn from(conversation: entities::Conversation) -> Self {
            ConversationSummary {
                conversation_id: conversation.id,
                title: conversation.title,
                subject: conversation.subject,
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct ConversationHistory {
        pub conversation_id: i64,
        pub title: String,
        pub subject: String,
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Message {
        pub role: String,
        pub content: String,
        pub message_id: i64,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                role: message.role.to_string(),
                content: message.content,
                message_id: message.id,
            }
        }
    }
}
