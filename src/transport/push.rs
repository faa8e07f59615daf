use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{ChannelAdapter, ChannelKind, RenderedPayload};
use crate::GestureEvent;

/// POSTs the JSON alert document to a webhook-style push endpoint.
pub struct PushAdapter {
    name: String,
    url: String,
    agent: ureq::Agent,
}

impl PushAdapter {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            name: name.to_string(),
            url: url.to_string(),
            agent,
        }
    }
}

impl ChannelAdapter for PushAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn send(&self, event: &GestureEvent, payload: &RenderedPayload) -> Result<()> {
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .set("X-Gesture-Label", event.label().as_str())
            .send_string(&payload.json);
        match response {
            Ok(resp) => {
                log::debug!("[{}] push accepted ({})", self.name, resp.status());
                Ok(())
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("push endpoint {} returned HTTP {}", self.url, code))
            }
            Err(e) => Err(anyhow!("push to {} failed: {}", self.url, e)),
        }
    }
}
