//! Tutor answer generation.
//!
//! Builds the message list sent to the chat model (persona, replayed history,
//! composed prompt), opens the completion stream with retries, and relays the
//! streamed fragments to the HTTP response while accumulating the answer for
//! the transcript.

use crate::config::Settings;
use crate::core::traits::{AnswerGenerator, ConversationService};
use crate::error::{Error, Result};
use crate::infrastructure::entities;
use crate::infrastructure::traits::{ChatModel, FragmentStream};
use async_trait::async_trait;
use di::{Ref, injectable};
use futures_util::StreamExt;
use log::{error, info, warn};
use minijinja::{Environment, context};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Fixed instruction block sent as the system message of every completion.
pub const PERSONA: &str = r#"# StudyBuddy

You are **StudyBuddy**, a patient tutor for students of any subject: sciences, mathematics, languages, history, programming and more.

## Goal
Help the student *understand*, not just get an answer. Explain at the student's level, build from simple to detailed, and keep a warm, encouraging tone.

## Formatting
Always answer in Markdown.
* Start with a `#` title naming the topic.
* Use `##` and `###` headers to separate the explanation, worked examples and steps.
* Put key terms in **bold** and use *italics* for emphasis.
* Use `inline code` for identifiers and short expressions.
* Put programs, formulas and derivations in fenced code blocks.
* Use bullet lists for definitions, key points and procedures, and tables for comparisons.

## Teaching
1. Give a short, plain explanation before going into depth.
2. Always include at least one worked example, formatted as a quoted block starting with **Example:**.
3. Solve numerical problems step by step and finish with a clearly marked final answer.
4. When the question is ambiguous, ask one polite clarifying question.
5. When document context is provided, base the answer on it and say so; if it does not cover the question, answer from general knowledge.
6. Use analogies and text diagrams where they help.

## Example
**Student:** What is Newton's second law?

# Newton's Second Law
The **net force** on an object equals its **mass** times its *acceleration*.

```
F = m × a
```

> **Example:** pushing a 2 kg box with 10 N gives `a = 10 / 2 = 5 m/s²`.
"#;

const PROMPT_TEMPLATE: &str = r#"Subject: {{ subject }}
{% if context %}
Context from the student's documents:
{{ context }}
{% endif %}
Student question:
{{ question }}"#;

const RELAY_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<entities::Message> for ChatMessage {
    fn from(m: entities::Message) -> Self {
        Self {
            content: m.content,
            role: match m.role {
                entities::MessageRole::User => Role::User,
                entities::MessageRole::Assistant => Role::Assistant,
            },
        }
    }
}

/// Renders the per-question prompt from the conversation subject, the
/// retrieved context (may be empty) and the question.
pub fn compose_prompt(subject: &str, retrieved: &str, question: &str) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template("prompt", PROMPT_TEMPLATE)?;

    let prompt = env.get_template("prompt")?.render(context! {
        subject => subject,
        context => retrieved.trim(),
        question => question,
    })?;

    Ok(prompt)
}

/// Persona first, then the transcript in order, then the new prompt.
pub fn build_messages(persona: &str, history: &[ChatMessage], prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new(Role::System, persona));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::new(Role::User, prompt));
    messages
}

#[injectable(AnswerGenerator)]
pub struct TutorAnswerGenerator {
    model: Ref<dyn ChatModel>,
    settings: Ref<Settings>,
}

impl TutorAnswerGenerator {
    pub fn new(model: Ref<dyn ChatModel>, settings: Ref<Settings>) -> Self {
        Self { model, settings }
    }
}

#[async_trait]
impl AnswerGenerator for TutorAnswerGenerator {
    async fn stream(
        &self,
        persona: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<FragmentStream> {
        let messages = build_messages(persona, history, prompt);
        let mut attempt = 0;

        loop {
            match self.model.stream_chat(&messages).await {
                Ok(fragments) => return Ok(fragments),
                Err(e) if e.is_retriable() && attempt < self.settings.model_max_retries => {
                    let delay = Duration::from_millis(
                        self.settings
                            .model_retry_backoff_ms
                            .saturating_mul(2u64.saturating_pow(attempt)),
                    );
                    attempt += 1;
                    warn!(
                        "{} unavailable ({e}), retry {attempt}/{} in {delay:?}",
                        self.model.name(),
                        self.settings.model_max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drains `fragments` on a background task, forwarding each one to the
/// returned receiver and saving the full answer as the assistant message
/// once the stream is exhausted.
///
/// The answer is saved before the receiver closes, even if the receiver was
/// dropped early. If the stream fails nothing is saved and the error is the
/// last item the receiver sees.
pub fn relay_answer(
    mut fragments: FragmentStream,
    conversations: Ref<dyn ConversationService>,
    conversation_id: i64,
) -> mpsc::Receiver<Result<String>> {
    let (sender, receiver) = mpsc::channel::<Result<String>>(RELAY_BUFFER);

    tokio::spawn(async move {
        let started = Instant::now();
        let mut answer = String::new();
        let mut total_fragments = 0;
        let mut listening = true;

        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(fragment) => {
                    answer.push_str(&fragment);
                    total_fragments += 1;

                    if listening && sender.send(Ok(fragment)).await.is_err() {
                        listening = false;
                        warn!(
                            "Client left conversation {conversation_id} mid-answer, finishing in background."
                        );
                    }
                }
                Err(e) => {
                    error!(
                        "Answer for conversation {conversation_id} failed after {total_fragments} fragments: {e}"
                    );
                    sender.send(Err(e)).await.ok();
                    return;
                }
            }
        }

        match conversations
            .create_assistant_message(conversation_id, answer)
            .await
        {
            Ok(message) => info!(
                "Answer {} for conversation {conversation_id} done: {total_fragments} fragments in {:?}.",
                message.id,
                started.elapsed()
            ),
            Err(e) => {
                error!("Could not save answer for conversation {conversation_id}: {e}");
                sender
                    .send(Err(Error::Internal(format!("answer was not saved: {e}"))))
                    .await
                    .ok();
            }
        }
    });

    receiver
}
