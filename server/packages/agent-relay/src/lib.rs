//! Agent relay core: HTTP surface, turn orchestration, and the subprocess
//! protocol plumbing behind it.

pub mod chat;
pub mod cli;
pub mod launcher;
pub mod protocol;
pub mod router;
pub mod session_store;
pub mod translate;
