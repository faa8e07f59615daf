use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectionSource;
use crate::detect::result::Frame;

/// Stub source for testing. Replays a fixed list of frames in order.
pub struct ScriptedSource {
    name: String,
    frames: VecDeque<Frame>,
}

impl ScriptedSource {
    pub fn new(name: &str, frames: Vec<Frame>) -> Self {
        Self {
            name: name.to_string(),
            frames: frames.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl DetectionSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_frames_then_ends() -> Result<()> {
        let frames = vec![
            Frame {
                timestamp_ms: 0,
                detections: vec![],
            },
            Frame {
                timestamp_ms: 33,
                detections: vec![],
            },
        ];
        let mut source = ScriptedSource::new("scripted", frames);
        assert_eq!(source.next_frame()?.map(|f| f.timestamp_ms), Some(0));
        assert_eq!(source.next_frame()?.map(|f| f.timestamp_ms), Some(33));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.remaining(), 0);
        Ok(())
    }
}
