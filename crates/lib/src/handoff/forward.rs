//! Default collaborator: POSTs every handoff as JSON to a downstream webhook, or
//! logs it when no URL is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use super::{
    ButtonFollowup, CardActionHandler, HandlerError, MessageHandler, MessageHandoff, TaskChange,
    TaskHandler,
};
use crate::config::DownstreamConfig;

#[derive(Clone)]
pub struct ForwardingHandler {
    url: Option<String>,
    client: reqwest::Client,
}

impl ForwardingHandler {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                log::warn!(
                    "handoff: downstream client without {:?} timeout, builder failed: {}",
                    timeout,
                    e
                );
                reqwest::Client::new()
            }
        };
        Self {
            url: url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            client,
        }
    }

    pub fn from_config(config: &DownstreamConfig) -> Self {
        Self::new(config.url.clone(), Duration::from_secs(config.timeout_secs))
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    async fn forward<T: Serialize>(&self, kind: &str, payload: &T) -> Result<(), HandlerError> {
        let body = json!({ "kind": kind, "payload": payload });
        let Some(url) = self.url.as_deref() else {
            log::info!("handoff (no downstream url): {}", body);
            return Ok(());
        };
        let res = self.client.post(url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(HandlerError::Rejected(format!("{} {}", status, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn on_direct_message(&self, msg: MessageHandoff) -> Result<(), HandlerError> {
        self.forward("directMessage", &msg).await
    }

    async fn on_group_mention(&self, msg: MessageHandoff) -> Result<(), HandlerError> {
        self.forward("groupMention", &msg).await
    }

    async fn on_thread_reply(&self, msg: MessageHandoff) -> Result<(), HandlerError> {
        self.forward("threadReply", &msg).await
    }
}

#[async_trait]
impl CardActionHandler for ForwardingHandler {
    async fn on_button_followup(&self, followup: ButtonFollowup) -> Result<(), HandlerError> {
        self.forward("buttonFollowup", &followup).await
    }
}

#[async_trait]
impl TaskHandler for ForwardingHandler {
    async fn on_task_changed(&self, change: TaskChange) -> Result<(), HandlerError> {
        self.forward("taskChanged", &change).await
    }
}
