pub mod call_api;

pub use call_api::{forward_events, AppState};
