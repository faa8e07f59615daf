use anyhow::{Context, Result};
use std::io::{IsTerminal, Write};

use super::{ChannelAdapter, ChannelKind, RenderedPayload};
use crate::GestureEvent;

/// Local audible alert: rings the terminal bell and logs the subject line.
pub struct SoundAdapter {
    name: String,
    volume: u8,
}

impl SoundAdapter {
    pub fn new(name: &str, volume: u8) -> Self {
        Self {
            name: name.to_string(),
            volume: volume.min(100),
        }
    }

    /// Bell count for the configured volume: 0 when muted, otherwise 1..=3.
    pub fn bell_count(&self) -> usize {
        match self.volume {
            0 => 0,
            1..=33 => 1,
            34..=66 => 2,
            _ => 3,
        }
    }
}

impl ChannelAdapter for SoundAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sound
    }

    fn send(&self, _event: &GestureEvent, payload: &RenderedPayload) -> Result<()> {
        log::info!("[{}] {}", self.name, payload.subject);
        let bells = self.bell_count();
        let mut stderr = std::io::stderr();
        if bells > 0 && stderr.is_terminal() {
            stderr
                .write_all("\x07".repeat(bells).as_bytes())
                .and_then(|_| stderr.flush())
                .context("failed to ring terminal bell")?;
        }
        Ok(())
    }
}
