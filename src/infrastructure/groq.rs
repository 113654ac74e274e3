//! Streaming client for Groq's OpenAI-compatible chat completions API.

use crate::config::Settings;
use crate::core::assistant::ChatMessage;
use crate::error::{Error, Result};
use crate::infrastructure::traits::{ChatModel, FragmentStream};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct GroqClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}

impl GroqClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .groq_api_key
            .clone()
            .ok_or_else(|| Error::Config("GROQ_API_KEY must be set".into()))?;

        // No total deadline: a long answer may stream for minutes. Only the
        // connection and the gaps between chunks are bounded.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.model_connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.model_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.groq_base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: settings.groq_model.clone(),
            temperature: settings.model_temperature,
        })
    }
}

#[async_trait]
impl ChatModel for GroqClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream> {
        debug!(
            "requesting completion from {} with {} messages",
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                stream: true,
                temperature: self.temperature,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_upstream_status(
                status,
                format!("chat completion failed: HTTP {status} - {body}"),
            ));
        }

        Ok(Box::pin(sse_fragments(response.bytes_stream())))
    }
}

/// One decoded line of a server-sent-event body.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.trim_end().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };

    let data = data.trim_start();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| Error::transient_model(format!("malformed stream chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(Error::transient_model(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(SseLine::Fragment)
        .unwrap_or(SseLine::Skip))
}

/// Turns a raw SSE byte stream into content fragments.
///
/// Bytes are buffered until a full line is available, so a multi-byte
/// character split across network chunks is decoded intact. The stream only
/// ends cleanly on `data: [DONE]`; running out of bytes before that yields a
/// transient model error as the last item.
pub fn sse_fragments<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        for await chunk in bytes {
            let chunk = chunk.map_err(|e| -> Error { e.into() })?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    SseLine::Fragment(fragment) => {
                        yield fragment;
                    }
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }

            if finished {
                break;
            }
        }

        if !finished && !buffer.is_empty() {
            match parse_sse_line(&String::from_utf8_lossy(&buffer))? {
                SseLine::Fragment(fragment) => {
                    yield fragment;
                }
                SseLine::Done => finished = true,
                SseLine::Skip => {}
            }
        }

        // a body cut off before the terminator is an unfinished answer
        if !finished {
            Err::<(), Error>(Error::transient_model("stream ended before [DONE]"))?;
        }
    }
}
