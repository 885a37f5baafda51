//! Command-line voice agent built on the `convai` session.
//!
//! Loads settings from the environment, wires a [`convai::ConversationSession`]
//! to file or device audio and supervises the conversation.

pub mod check;
pub mod config;
pub mod devices;
pub mod supervisor;
