//! RTMP session state management

pub mod state;

pub use state::{SessionStage, SessionState};
