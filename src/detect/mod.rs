mod backend;
mod backends;
mod result;

pub use backend::DetectionSource;
pub use backends::{JsonlSource, ScriptedSource};
pub use result::{BoundingBox, Frame, Landmark, RawDetection};
