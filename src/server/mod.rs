//! Network server module
//!
//! A single listener serves both components: WebSocket upgrades are handed
//! to the relay, everything else is answered by the score routes.

mod listener;
pub mod routes;

pub use listener::*;
