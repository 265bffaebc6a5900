use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::executor::ToolCallRequest;
use crate::tools::ToolSpec;

/// One entry of the transcript sent to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnMessage {
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        content: Value,
    },
}

/// The model's reply for one round: optional text and the tools it wants run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmTurn {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl LlmTurn {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_calls: Vec::new() }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self { text: None, tool_calls }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn next_turn(&self, transcript: &[TurnMessage], tools: &[ToolSpec]) -> Result<LlmTurn>;
}

/// Replays canned turns in order and keeps every transcript it was shown.
#[derive(Default)]
pub struct ScriptedLlmClient {
    turns: Mutex<VecDeque<LlmTurn>>,
    seen: Mutex<Vec<Vec<TurnMessage>>>,
}

impl ScriptedLlmClient {
    pub fn new(turns: impl IntoIterator<Item = LlmTurn>) -> Self {
        Self { turns: Mutex::new(turns.into_iter().collect()), seen: Mutex::default() }
    }

    pub async fn transcripts(&self) -> Vec<Vec<TurnMessage>> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn next_turn(&self, transcript: &[TurnMessage], _tools: &[ToolSpec]) -> Result<LlmTurn> {
        self.seen.lock().await.push(transcript.to_vec());
        self.turns.lock().await.pop_front().ok_or_else(|| anyhow!("script exhausted"))
    }
}
