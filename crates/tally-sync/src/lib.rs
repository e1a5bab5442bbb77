//! Client-side session sync: keeps a local snapshot of one session current
//! from the server's push channel, reconnecting and re-fetching as needed.

pub mod adapter;
pub mod countdown;
pub mod error;
pub mod share;
pub mod transport;
pub mod ws;

pub use adapter::{BackoffConfig, SessionSync, SyncState, CLOSED_NOTICE};
pub use countdown::Countdown;
pub use error::SyncError;
pub use share::{combined_order_text, settlement_csv};
pub use transport::{EventStream, SyncEvent, SyncTransport};
pub use ws::WsTransport;
