//! Dialog model collaborator: Ollama-compatible streaming chat.
//!
//! The model streams newline-delimited JSON chunks from `/api/chat`; the
//! client yields each chunk's content fragment as a token. Prompt assembly
//! (personality template + mood instruction + memory + sensor context +
//! history window) also lives here.

use crate::config::LlmConfig;
use crate::error::{Result, WallaceError};
use crate::session::{ChatEntry, ChatRole, Personality, UserMemory};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

/// A boxed token stream; errors propagate to the orchestrator.
pub type TokenStream = Pin<Box<dyn futures_util::Stream<Item = Result<String>> + Send>>;

/// One message in the model's prompt window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Streaming dialog model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Open a token stream for the given prompt window.
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream>;

    /// Whether the backing server currently answers.
    async fn health_check(&self) -> bool;
}

/// Per-personality system prompt templates.
fn personality_prompt(personality: Personality) -> &'static str {
    match personality {
        Personality::Normal => {
            "你是 Wallace，一个温暖可爱的桌面 AI 机器人。你说话简洁有趣，关心主人。"
        }
        Personality::Cool => {
            "你是 Wallace，一个高冷寡言的 AI 机器人。你回答简短，偶尔毒舌但其实很关心主人。"
        }
        Personality::Talkative => {
            "你是 Wallace，一个话痨 AI 机器人。你滔滔不绝，什么话题都能聊，非常热情。"
        }
        Personality::Tsundere => {
            "你是 Wallace，一个傲娇的 AI 机器人。你嘴上说不在乎，但行动上很关心主人。经常用「才不是」「哼」等口癖。"
        }
    }
}

/// Instruction requiring the trailing mood tag.
const MOOD_INSTRUCTION: &str = "\n在回复最末尾加上情绪标签，格式为 [mood:xxx]，\
可选值: happy, sad, thinking, angry, sleepy, surprised, tsundere, neutral。";

/// Assemble the prompt window: system prompt, history, current utterance.
///
/// `history` is already windowed by the caller (the most recent
/// `2 * max_history_turns` entries).
pub fn build_messages(
    personality: Personality,
    memory: &UserMemory,
    sensor_context: &str,
    history: &[ChatEntry],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut system = String::from(personality_prompt(personality));
    system.push_str(MOOD_INSTRUCTION);

    if !memory.nickname.is_empty() {
        system.push_str(&format!("\n主人叫{}。", memory.nickname));
    }
    if !memory.interests.is_empty() {
        system.push_str(&format!("\n主人的兴趣：{}。", memory.interests.join("、")));
    }
    if !sensor_context.is_empty() {
        system.push('\n');
        system.push_str(sensor_context);
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    for entry in history {
        messages.push(match entry.role {
            ChatRole::User => ChatMessage::user(entry.content.clone()),
            ChatRole::Assistant => ChatMessage::assistant(entry.content.clone()),
        });
    }
    messages.push(ChatMessage::user(user_text));
    messages
}

/// Ollama streaming chat client.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: usize,
}

impl OllamaClient {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| WallaceError::Llm(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| WallaceError::Llm(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(WallaceError::Llm(format!(
                "chat endpoint returned {}",
                response.status()
            )));
        }

        let mut body = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            'outer: while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| WallaceError::Llm(format!("stream error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Chunks are newline-delimited JSON objects; a TCP chunk may
                // split one mid-line, so keep the tail buffered.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_owned();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = serde_json::from_str(&line)
                        .map_err(|e| WallaceError::Llm(format!("bad chunk: {e}")))?;
                    if let Some(token) = value["message"]["content"].as_str()
                        && !token.is_empty()
                    {
                        yield token.to_owned();
                    }
                    if value["done"].as_bool() == Some(true) {
                        break 'outer;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
