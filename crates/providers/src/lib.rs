//! Model provider implementations for stockchat.
//!
//! All providers implement the `stockchat_core::Provider` trait.

pub mod responses;
pub mod scripted;

pub use responses::ResponsesProvider;
pub use scripted::{ScriptedProvider, ScriptedResponse};
