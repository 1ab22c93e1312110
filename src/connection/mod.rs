//! Link ownership: per-device state machine, capped connection pool, and the
//! reconnection controller that re-establishes dropped links.

pub mod pool;
pub mod reconnect;
pub mod state;
