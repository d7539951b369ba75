//! Connection-pool networking core for event-driven TCP/UDP servers and
//! clients.
//!
//! A [`Pool`] owns a fixed-capacity array of connection slots, an optional
//! listening socket and a readiness notifier. All I/O is multiplexed through
//! a single-threaded event loop ([`Pool::poll`]); the embedder is notified
//! through a [`PoolHandler`] receiving one of ten [`Signal`]s per event.
//!
//! UDP listeners hand out "pseudo-connections": one slot per remote endpoint
//! observed on the shared listener socket, so the embedder sees the same
//! per-peer connection model for both transports.

pub mod clock;
pub mod conn;
pub mod endpoint;
mod error;
pub mod notifier;
pub mod pool;
pub mod signal;

pub use conn::{Conn, ConnFlags, ConnState};
pub use endpoint::{Endpoint, Family};
pub use error::{Error, Result};
pub use notifier::{Event, FdStatus, Notifier};
pub use pool::{Pool, PoolConfig, PoolFlags, PoolStats, RecvStatus, Transport};
pub use signal::{PoolHandler, Signal};
