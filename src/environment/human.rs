//! Human Input Collaborator
//!
//! Human-in-the-loop steps ask a person for a line of text through the
//! [`HumanInput`] trait and suspend until it arrives. Because the scheduler
//! runs one step at a time, nothing else in the run progresses meanwhile.

use std::collections::VecDeque;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Errors surfaced while waiting for human input.
#[derive(Debug, Error)]
pub enum HumanInputError {
    #[error("human input stream closed")]
    Closed,

    #[error("failed to read human input: {0}")]
    Io(#[from] std::io::Error),

    #[error("no human input source configured")]
    Unavailable,
}

/// Prompts a human and waits for a reply.
#[async_trait]
pub trait HumanInput: Send + Sync {
    async fn prompt_human(&self, text: &str) -> Result<String, HumanInputError>;
}

/// Placeholder used when a run has no human input source.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHuman;

#[async_trait]
impl HumanInput for NoHuman {
    async fn prompt_human(&self, _text: &str) -> Result<String, HumanInputError> {
        Err(HumanInputError::Unavailable)
    }
}

/// Prompts on stdout and reads one line from stdin per call.
pub struct StdinHuman {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinHuman {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(io::stdin()).lines()),
        }
    }
}

impl Default for StdinHuman {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HumanInput for StdinHuman {
    async fn prompt_human(&self, text: &str) -> Result<String, HumanInputError> {
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let line = self.lines.lock().await.next_line().await?;
        line.map(|l| l.trim_end().to_string())
            .ok_or(HumanInputError::Closed)
    }
}

/// Answers prompts from a fixed list of replies.
#[derive(Debug, Default)]
pub struct ScriptedHuman {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedHuman {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far, in call order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl HumanInput for ScriptedHuman {
    async fn prompt_human(&self, text: &str) -> Result<String, HumanInputError> {
        self.prompts.lock().await.push(text.to_string());

        let reply = self.replies.lock().await.pop_front();
        debug!("Scripted human reply: {:?}", reply);
        reply.ok_or(HumanInputError::Closed)
    }
}
