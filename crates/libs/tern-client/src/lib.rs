//! # tern-client
//!
//! The RTM session/client orchestrator. A [`Client`] serializes every
//! client-level operation (open, close, token refresh, conversation and
//! member mutations, history queries) on one FIFO queue, drives the
//! connection engine underneath, and keeps the conversation cache consistent
//! across reconnection gaps.
//!
//! Collaborators are injected at construction: the frame transport, the
//! signature source, reachability and app-lifecycle feeds, and a
//! [`ClientDelegate`] receiving session events and server pushes.

pub mod client;
pub mod delegate;
pub mod error;
mod notifications;
pub mod session;
pub mod signature;

pub use client::{CacheOption, Client, ClientConfig, MessageOptions, OpenOption};
pub use delegate::{ClientDelegate, NoopClientDelegate};
pub use error::ClientError;
pub use session::SessionStatus;
pub use signature::{NoSignature, Signature, SignatureAction, SignatureSource};

pub use tern_wire::command::{IntervalBound, MessageItem, QueryDirection};
