//! Signal dispatch to the embedder.

use crate::conn::Conn;

/// Event codes delivered to the pool callback.
///
/// Only [`Signal::Accepted`] consults the callback's return value: `false`
/// rejects the new connection, the pool closes it and surfaces
/// [`crate::Error::AcceptDenied`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
	/// A slot came into existence (pool creation or resize-up). The embedder
	/// may allocate per-connection user data here.
	Created,
	/// A slot is going away (resize-down or pool destruction). Last chance to
	/// release user data.
	Destroying,
	/// An outbound connection is established. Not emitted for slots
	/// synthesized from a UDP listener.
	Connected,
	/// An inbound connection was admitted. Return `false` to deny it.
	Accepted,
	/// The connection is about to be torn down; the slot is still intact.
	Closing,
	/// This slot is the target of a connection move.
	MovedTo,
	/// This slot is the source of a connection move; reinitialize user data.
	MovedFrom,
	/// New bytes are available in the receive buffer.
	DataIn,
	/// The socket can accept more outgoing data (ASYNC pools only).
	CanSend,
	/// The connection reached its deadline and will be closed next.
	TimedOut,
	/// Unread bytes remain buffered: either the peer half-closed with data
	/// pending, or the embedder has not consumed the buffer by poll end.
	DataLeft,
}

/// Receiver for pool signals.
///
/// Invoked synchronously from inside pool operations; the slot handed in is
/// the one the signal concerns. Handlers may read and consume the slot's
/// buffer and send on it, but cannot reach back into the pool (the pool is
/// mutably borrowed for the duration of the call).
pub trait PoolHandler {
	fn on_signal(&mut self, conn: &mut Conn, signal: Signal) -> bool;
}

/// A pool without a handler: every signal is acknowledged, every connection
/// admitted.
impl PoolHandler for () {
	fn on_signal(&mut self, _conn: &mut Conn, _signal: Signal) -> bool {
		true
	}
}

impl<F> PoolHandler for F
where
	F: FnMut(&mut Conn, Signal) -> bool,
{
	fn on_signal(&mut self, conn: &mut Conn, signal: Signal) -> bool {
		self(conn, signal)
	}
}
