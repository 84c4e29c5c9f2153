//! Command handlers for WebSocket messages
//!
//! Lifecycle commands go to the [`PipelineSupervisor`] on the blocking pool,
//! since starting and stopping wait on devices and threads.

use std::sync::Arc;

use parking_lot::RwLock;

use super::protocol::{Command, ConfigReply, Event};
use crate::pipeline::PipelineSupervisor;

/// Avatar model chosen by the last `set_model` command
#[derive(Debug, Default)]
pub struct ModelSelection {
    path: RwLock<Option<String>>,
}

impl ModelSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: String) {
        *self.path.write() = Some(path);
    }

    pub fn current(&self) -> Option<String> {
        self.path.read().clone()
    }
}

/// Direct reply to the connection that sent a command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Config(ConfigReply),
    Event(Event),
}

impl Reply {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Reply::Config(config) => serde_json::to_string(config),
            Reply::Event(event) => event.to_json(),
        }
    }
}

/// Handles decoded client commands
pub struct CommandHandler {
    supervisor: Arc<PipelineSupervisor>,
    model: Arc<ModelSelection>,
}

impl CommandHandler {
    pub fn new(supervisor: Arc<PipelineSupervisor>, model: Arc<ModelSelection>) -> Self {
        Self { supervisor, model }
    }

    pub fn supervisor(&self) -> &Arc<PipelineSupervisor> {
        &self.supervisor
    }

    /// Handle a command; `Some` when the sender gets a reply
    pub async fn handle(&self, command: Command) -> Option<Reply> {
        match command {
            Command::StartTracking => self.start_tracking().await,
            Command::StopTracking => {
                self.stop_tracking().await;
                None
            }
            Command::SetModel { path } => {
                tracing::info!("Model set to {}", path);
                self.model.set(path);
                None
            }
            Command::GetConfig => Some(Reply::Config(ConfigReply::from_config(
                self.supervisor.config(),
            ))),
        }
    }

    async fn start_tracking(&self) -> Option<Reply> {
        let supervisor = self.supervisor.clone();
        let message = match tokio::task::spawn_blocking(move || supervisor.start()).await {
            Ok(Ok(())) => return None,
            Ok(Err(e)) => {
                tracing::warn!("start_tracking rejected: {}", e);
                e.to_string()
            }
            Err(e) => {
                tracing::error!("start_tracking task failed: {}", e);
                format!("start failed: {}", e)
            }
        };
        Some(Reply::Event(Event::Error(message)))
    }

    /// Stop the pipeline; idle pipelines are left alone
    pub async fn stop_tracking(&self) {
        let supervisor = self.supervisor.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || supervisor.stop()).await {
            tracing::error!("stop_tracking task failed: {}", e);
        }
    }
}
