pub mod jsonl;
pub mod stub;

pub use jsonl::JsonlSource;
pub use stub::ScriptedSource;
