pub mod auto_answer;
pub mod engine;

pub use auto_answer::AutoAnswerTimer;
pub use engine::{CallEngine, EngineEvent};
