//! Domain model, cost settlement, and error taxonomy for group-order sessions.
//!
//! Everything here is pure: no I/O, no locks. Storage, transport and
//! broadcasting live in the other workspace crates.

pub mod errors;
pub mod events;
pub mod ids;
pub mod model;
pub mod settlement;
pub mod view;

pub use errors::SessionError;
pub use events::{SessionEvent, WireEvent};
pub use ids::{ParticipantId, SessionId, SubscriberId};
pub use model::{LineItem, NewSession, Order, RestaurantRef, Session, SessionStatus};
pub use settlement::{settle, CombinedLine, ParticipantCost, Settlement, SettlementSummary};
pub use view::{SessionView, SettledSession};
