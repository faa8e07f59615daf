use anyhow::Result;

use crate::detect::result::Frame;

/// Pull-model source of per-frame hand detections.
///
/// The classifier that produces the detections lives outside this crate.
/// Implementations only adapt its output into `Frame`s; the caller decides
/// the cadence by how often it calls `next_frame`.
pub trait DetectionSource: Send {
    /// Source identifier, recorded as the session source.
    fn name(&self) -> &str;

    /// Next frame, or `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
