//! Notification channel adapters.
//!
//! An adapter turns one rendered alert into one delivery attempt on one
//! medium. Adapters are opaque to the dispatcher: they may be slow or fail,
//! and they are always invoked under the dispatcher's per-call timeout.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChannelSettings, ChannelTarget};
use crate::GestureEvent;

mod email;
#[cfg(feature = "channel-mqtt")]
mod mqtt;
#[cfg(feature = "channel-push")]
mod push;
mod sound;

pub use email::EmailSpoolAdapter;
#[cfg(feature = "channel-mqtt")]
pub use mqtt::{parse_mqtt_endpoint, MqttAdapter, MqttEndpoint};
#[cfg(feature = "channel-push")]
pub use push::PushAdapter;
pub use sound::SoundAdapter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Sound,
    Email,
    Push,
    Mqtt,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Sound => "sound",
            ChannelKind::Email => "email",
            ChannelKind::Push => "push",
            ChannelKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-independent renderings of one alert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPayload {
    pub subject: String,
    pub body: String,
    pub json: String,
}

pub trait ChannelAdapter: Send + Sync {
    /// Channel name as configured; used in logs and dispatch records.
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// One delivery attempt. Errors are retryable from the dispatcher's
    /// point of view.
    fn send(&self, event: &GestureEvent, payload: &RenderedPayload) -> Result<()>;
}

/// Build the shipped adapter for a configured channel.
pub fn build_adapter(
    channel: &ChannelSettings,
    call_timeout: Duration,
) -> Result<Arc<dyn ChannelAdapter>> {
    let adapter: Arc<dyn ChannelAdapter> = match &channel.target {
        ChannelTarget::Sound { volume } => Arc::new(SoundAdapter::new(&channel.name, *volume)),
        ChannelTarget::Email {
            spool_dir,
            from,
            recipients,
        } => Arc::new(EmailSpoolAdapter::new(
            &channel.name,
            spool_dir,
            from,
            recipients.clone(),
        )?),
        #[cfg(feature = "channel-push")]
        ChannelTarget::Push { url } => Arc::new(PushAdapter::new(&channel.name, url, call_timeout)),
        #[cfg(feature = "channel-mqtt")]
        ChannelTarget::Mqtt {
            broker,
            topic_prefix,
            client_id,
        } => Arc::new(MqttAdapter::connect(
            &channel.name,
            broker,
            topic_prefix,
            client_id,
        )?),
        #[allow(unreachable_patterns)]
        other => {
            let _ = call_timeout;
            return Err(anyhow!(
                "channel '{}': {} support was not compiled in (enable the channel-{} feature)",
                channel.name,
                other.kind(),
                other.kind()
            ));
        }
    };
    Ok(adapter)
}
