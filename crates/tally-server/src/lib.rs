//! Session service, realtime broadcaster and the HTTP/WebSocket transport.

pub mod broadcaster;
pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod service;

pub use broadcaster::SubscriberRegistry;
pub use server::{start, ServerHandle};
pub use service::{Actor, Clock, CreateSession, HistoryEntry, SessionService};
