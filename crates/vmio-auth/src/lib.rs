//! vmio Auth - tickets and authorization
//!
//! A ticket authorizes data-plane access to one image for a window of
//! time. The in-memory store maps ticket ids to tickets; every ticket
//! owns the backend contexts opened on its behalf and tracks the
//! operations running under it.

pub mod error;
pub mod store;
pub mod ticket;

pub use error::AuthError;
pub use store::TicketStore;
pub use ticket::{Context, Op, Ticket};
