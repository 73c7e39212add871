pub mod claude;
pub mod event;
pub mod subprocess;

pub use claude::ClaudeExecutor;
pub use subprocess::{spawn_jsonl, JsonlStream, SpawnOptions, StreamError};
