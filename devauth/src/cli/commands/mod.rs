//! Command implementations.

pub mod auth;
pub mod call;
pub mod completions;

pub use auth::{handle_login, handle_logout, handle_status};
pub use call::handle_call;
pub use completions::handle_completions;
