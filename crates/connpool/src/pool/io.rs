//! Buffered receive, send entry points and connection teardown.

use std::mem::MaybeUninit;

use connpool_core::fanout;
use tracing::debug;

use crate::conn::{ConnFlags, ConnState};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolFlags};
use crate::signal::{PoolHandler, Signal};

/// Outcome of one receive pass over a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
	/// `n` new bytes were appended at `buf[buffill - n..buffill]`.
	Data(usize),
	/// Nothing was waiting (or a zero-length datagram was consumed).
	NoData,
	/// No space left; the embedder must drain the buffer first.
	BufferFull,
	/// The peer shut down in order. Buffered bytes remain readable.
	Disconnected,
}

/// socket2 takes `MaybeUninit` buffers; our receive window is initialized
/// memory, which is always a valid view.
fn writable_window(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
	unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

impl<H: PoolHandler> Pool<H> {
	/// Receives whatever is pending into the slot's buffer.
	///
	/// Housekeeping before the read: cursors are reset once the embedder has
	/// consumed everything, and when the read window has passed the 2/3 mark
	/// the unread bytes are compacted to the front. `UDP_IN` slots read from
	/// the pool's listener socket instead of their own descriptor.
	///
	/// A system error closes the connection and is returned; an empty socket
	/// is just [`RecvStatus::NoData`], and repeating the call then leaves
	/// the buffer fields untouched.
	pub fn recv(&mut self, idx: usize) -> Result<RecvStatus> {
		if idx >= self.conns.len() || !self.conns[idx].state.contains(ConnState::CONNECTED) {
			return Err(Error::InvalidConnIndex(idx));
		}
		let stream = self.flags.contains(PoolFlags::TCP);

		let outcome = {
			let Pool {
				conns, listener, ..
			} = self;
			let conn = &mut conns[idx];
			let bufsize = conn.buf.len();

			if conn.bufpos >= bufsize || conn.bufpos >= conn.buffill {
				// everything consumed; start over from the front
				conn.bufpos = 0;
				conn.buffill = 0;
			}
			if conn.bufpos > bufsize - bufsize / 3 {
				// read window passed the 2/3 mark: compact
				let unread = conn.buffill - conn.bufpos;
				conn.buf.copy_within(conn.bufpos..conn.buffill, 0);
				conn.buffill = unread;
				conn.bufpos = 0;
			}
			if conn.buffill == bufsize {
				return Ok(RecvStatus::BufferFull);
			}

			conn.state.insert(ConnState::IN);
			let fill = conn.buffill;
			let udp_in = conn.flags.contains(ConnFlags::UDP_IN);
			let r: std::io::Result<usize> = if udp_in {
				match listener.sock.as_ref() {
					Some(listener_sock) => {
						match listener_sock.recv_from_with_flags(
							writable_window(&mut conn.buf[fill..]),
							libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
						) {
							Ok((n, addr)) => {
								if let Some(sa) = addr.as_socket() {
									conn.remote = Some(Endpoint::from(sa));
								}
								Ok(n)
							},
							Err(e) => Err(e),
						}
					},
					None => Err(std::io::Error::other("pool has no listener socket")),
				}
			} else {
				match conn.sock.as_ref() {
					Some(sock) => sock.recv_with_flags(
						writable_window(&mut conn.buf[fill..]),
						libc::MSG_NOSIGNAL,
					),
					None => Err(std::io::Error::other("slot has no socket")),
				}
			};
			conn.state.remove(ConnState::IN);

			match r {
				Ok(n) if n > 0 => {
					conn.buffill += n;
					Ok(RecvStatus::Data(n))
				},
				// a zero-byte read on a datagram socket is an empty datagram,
				// not a shutdown
				Ok(_) if stream && !udp_in => Ok(RecvStatus::Disconnected),
				Ok(_) => Ok(RecvStatus::NoData),
				Err(e)
					if e.kind() == std::io::ErrorKind::WouldBlock
						|| e.kind() == std::io::ErrorKind::Interrupted =>
				{
					Ok(RecvStatus::NoData)
				},
				Err(e) => Err(e),
			}
		};

		match outcome {
			Ok(status) => Ok(status),
			Err(e) => {
				debug!("connection [{idx}] is dead prematurely: {e}");
				self.close_connection(idx);
				Err(Error::sys("recv", e))
			},
		}
	}

	/// Sends `data` on connection `idx`, blocking briefly under a slow peer
	/// unless the pool is in ASYNC mode (then [`Pool::send_async`] runs in
	/// its place). A broken connection is closed before returning the error.
	pub fn send(&mut self, idx: usize, data: &[u8]) -> Result<usize> {
		if self.flags.contains(PoolFlags::ASYNC) {
			return self.send_async(idx, data);
		}
		if idx >= self.conns.len() || !self.conns[idx].state.contains(ConnState::CONNECTED) {
			return Err(Error::InvalidConnIndex(idx));
		}
		let r = self.conns[idx].send(data);
		if self.conns[idx].is_marked_dead() {
			self.close_connection(idx);
		}
		r
	}

	/// Backpressure-aware send; see [`crate::Conn::send_async`].
	pub fn send_async(&mut self, idx: usize, data: &[u8]) -> Result<usize> {
		if idx >= self.conns.len() || !self.conns[idx].state.contains(ConnState::CONNECTED) {
			return Err(Error::InvalidConnIndex(idx));
		}
		let r = self.conns[idx].send_async(data);
		if self.conns[idx].is_marked_dead() {
			self.close_connection(idx);
		}
		r
	}

	/// Tears down connection `idx`: takes the fd out of the debug fanout if
	/// it doubled as a sink, emits `Closing`, deregisters the fd from the
	/// notifier, clears the slot state and closes the socket. Closing a free
	/// slot is a no-op.
	pub fn close_connection(&mut self, idx: usize) {
		if idx >= self.conns.len() || !self.conns[idx].state.contains(ConnState::CONNECTED) {
			return;
		}
		let fd = self.conns[idx].fd();
		let was_debug_sink = fd.is_some_and(fanout::is_member);
		if let Some(fd) = fd {
			if was_debug_sink {
				fanout::remove(fd);
			}
		}

		self.emit(idx, Signal::Closing);

		if let (Some(notifier), Some(fd)) = (self.notifier.as_ref(), fd) {
			let _ = notifier.remove(fd);
		}

		let conn = &mut self.conns[idx];
		conn.state = ConnState::empty();
		conn.sock = None;
		self.used_slots -= 1;

		// debug feeds do not count toward connection-time statistics
		if !was_debug_sink {
			self.stats.total_time += self.conns[idx].created_at.elapsed();
		}
		debug!("connection #{idx} closed");
	}
}
