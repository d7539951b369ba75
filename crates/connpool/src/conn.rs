//! Per-connection slot state.

use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use socket2::Socket;
use tracing::debug;

use crate::clock::Deadline;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

bitflags! {
	/// Connection status bits. Several can be meaningfully set at once
	/// (e.g. `CONNECTED | DISCONNECTION` while a half-closed peer's buffered
	/// bytes await consumption).
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct ConnState: u32 {
		/// I/O on this slot is no longer safe.
		const ERROR = 1;
		/// The slot is in use. Check the other bits before trusting it.
		const CONNECTED = 2;
		/// Reentrancy guard for internal operations.
		const BUSY = 4;
		/// A receive is in flight.
		const IN = 8;
		/// A send is in flight.
		const OUT = 16;
		/// Deadline reached, close pending.
		const EXPIRED = 32;
		/// Peer shut down in order; the slot is closed at the head of the
		/// next poll cycle so buffered bytes can still be consumed.
		const DISCONNECTION = 64;
	}
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct ConnFlags: u32 {
		/// Inbound UDP pseudo-connection: reads are satisfied from the
		/// pool's listener socket instead of this slot's own fd.
		const UDP_IN = 1;
	}
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOCK_MAX_TRIES: u32 = 10_000 / 50;

/// Waits for `BUSY` to clear, then sets it. Cooperative: with the pool driven
/// from one thread this never spins in correct use.
pub(crate) fn lock_state(state: &mut ConnState) -> Result<()> {
	for _ in 0..LOCK_MAX_TRIES {
		if !state.contains(ConnState::BUSY) {
			state.insert(ConnState::BUSY);
			return Ok(());
		}
		thread::sleep(LOCK_POLL_INTERVAL);
	}
	Err(Error::Locked)
}

/// One preallocated connection slot.
///
/// The receive buffer is accessed directly: `data()` is the unread window
/// `buf[bufpos..buffill]`, and the embedder advances `bufpos` via
/// [`Conn::advance`] as it consumes bytes. Do not keep absolute positions
/// across calls; the pool compacts the buffer when the read window passes
/// the 2/3 mark.
pub struct Conn {
	idx: usize,
	pub(crate) sock: Option<Socket>,
	pub(crate) flags: ConnFlags,
	pub(crate) local: Option<Endpoint>,
	pub(crate) remote: Option<Endpoint>,
	pub(crate) created_at: Instant,
	pub(crate) expire: Deadline,
	pub(crate) buf: Vec<u8>,
	pub(crate) bufpos: usize,
	pub(crate) buffill: usize,
	pub(crate) state: ConnState,
	user_data: Option<Box<dyn Any>>,
	pub(crate) stream: bool,
	pub(crate) nonblocking_send: bool,
}

impl Conn {
	pub(crate) fn new(
		idx: usize,
		bufsize: usize,
		stream: bool,
		nonblocking_send: bool,
	) -> Result<Conn> {
		let mut buf = Vec::new();
		buf.try_reserve_exact(bufsize).map_err(|_| Error::Oom)?;
		buf.resize(bufsize, 0);
		Ok(Conn {
			idx,
			sock: None,
			flags: ConnFlags::empty(),
			local: None,
			remote: None,
			created_at: Instant::now(),
			expire: Deadline::NONE,
			buf,
			bufpos: 0,
			buffill: 0,
			state: ConnState::empty(),
			user_data: None,
			stream,
			nonblocking_send,
		})
	}

	pub fn index(&self) -> usize {
		self.idx
	}

	pub fn fd(&self) -> Option<RawFd> {
		self.sock.as_ref().map(|s| s.as_raw_fd())
	}

	pub fn state(&self) -> ConnState {
		self.state
	}

	pub fn flags(&self) -> ConnFlags {
		self.flags
	}

	pub fn local(&self) -> Option<Endpoint> {
		self.local
	}

	pub fn remote(&self) -> Option<Endpoint> {
		self.remote
	}

	pub fn created_at(&self) -> Instant {
		self.created_at
	}

	pub fn expire(&self) -> Deadline {
		self.expire
	}

	/// Overrides the expiration deadline. `Deadline::NONE` makes the
	/// connection persistent.
	pub fn set_expire(&mut self, expire: Deadline) {
		self.expire = expire;
	}

	pub fn is_connected(&self) -> bool {
		self.state.contains(ConnState::CONNECTED)
	}

	/// Live means usable: connected and not in error state.
	pub fn is_live(&self) -> bool {
		self.is_connected() && !self.state.contains(ConnState::ERROR)
	}

	pub fn bufsize(&self) -> usize {
		self.buf.len()
	}

	pub fn bufpos(&self) -> usize {
		self.bufpos
	}

	pub fn buffill(&self) -> usize {
		self.buffill
	}

	/// The unread byte window.
	pub fn data(&self) -> &[u8] {
		&self.buf[self.bufpos..self.buffill]
	}

	/// Marks `n` bytes of the unread window as consumed.
	pub fn advance(&mut self, n: usize) {
		self.bufpos = (self.bufpos + n).min(self.buffill);
	}

	/// Resets the buffer cursors; optionally fills the whole buffer with
	/// `fill`.
	pub fn clear_buf(&mut self, fill: Option<u8>) {
		self.bufpos = 0;
		self.buffill = 0;
		if let Some(byte) = fill {
			self.buf.fill(byte);
		}
	}

	pub fn set_user_data(&mut self, data: Box<dyn Any>) {
		self.user_data = Some(data);
	}

	pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
		self.user_data.take()
	}

	pub fn user_data<T: 'static>(&self) -> Option<&T> {
		self.user_data.as_ref().and_then(|d| d.downcast_ref())
	}

	pub fn user_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
		self.user_data.as_mut().and_then(|d| d.downcast_mut())
	}

	pub(crate) fn lock(&mut self) -> Result<()> {
		lock_state(&mut self.state)
	}

	pub(crate) fn unlock(&mut self) {
		self.state.remove(ConnState::BUSY);
	}

	/// Takes over the connection carried by `src`: socket, endpoints,
	/// timestamps, state and the buffered bytes up to this slot's capacity.
	/// User data is swapped so the move source is left for the embedder to
	/// reinitialize on `MovedFrom`. The slot index and per-pool transport
	/// settings are kept.
	pub(crate) fn copy_from(&mut self, src: &mut Conn) {
		self.sock = src.sock.take();
		self.flags = src.flags;
		self.local = src.local;
		self.remote = src.remote;
		self.created_at = src.created_at;
		self.expire = src.expire;
		let n = self.buf.len().min(src.buf.len());
		self.buf[..n].copy_from_slice(&src.buf[..n]);
		self.bufpos = src.bufpos.min(self.buf.len());
		self.buffill = src.buffill.min(self.buf.len());
		self.state = src.state;
		std::mem::swap(&mut self.user_data, &mut src.user_data);
	}

	/// Synchronous send. Pools in ASYNC mode transparently use
	/// [`Conn::send_async`] instead.
	///
	/// Safe to call from inside a callback. A broken pipe marks the slot for
	/// teardown at the next poll cycle; [`crate::Pool::send`] additionally
	/// closes it immediately.
	pub fn send(&mut self, data: &[u8]) -> Result<usize> {
		if self.nonblocking_send {
			return self.send_async(data);
		}
		if !self.is_connected() || self.sock.is_none() {
			return Err(Error::InvalidConnIndex(self.idx));
		}
		self.state.insert(ConnState::OUT);
		let r = match self.sock.as_ref() {
			Some(sock) => sock.send_with_flags(data, libc::MSG_NOSIGNAL),
			None => Err(io::Error::other("no socket")),
		};
		self.state.remove(ConnState::OUT);
		match r {
			Ok(n) => Ok(n),
			Err(e) => {
				if e.raw_os_error() == Some(libc::EPIPE) {
					debug!("connection #{} is dead prematurely: {e}", self.idx);
					self.mark_dead();
				}
				Err(Error::sys("send", e))
			},
		}
	}

	/// Backpressure-aware send: on a full socket buffer the chunk is halved
	/// until something fits; chunks below 10 bytes give up. Returns the byte
	/// count actually handed to the kernel (0 when it gave up).
	pub fn send_async(&mut self, data: &[u8]) -> Result<usize> {
		if !self.is_connected() || self.sock.is_none() {
			return Err(Error::InvalidConnIndex(self.idx));
		}
		if data.is_empty() {
			return Ok(0);
		}
		self.state.insert(ConnState::OUT);
		let r = match self.sock.as_ref() {
			Some(sock) => send_chunked(sock, self.stream, self.remote.as_ref(), data),
			None => SendOutcome::Failed(io::Error::other("no socket")),
		};
		self.state.remove(ConnState::OUT);
		match r {
			SendOutcome::Sent(n) => Ok(n),
			SendOutcome::GaveUp => Ok(0),
			SendOutcome::PeerGone => {
				debug!("connection #{} is dead prematurely", self.idx);
				self.mark_dead();
				Ok(0)
			},
			SendOutcome::Broken(e) => {
				debug!("connection #{} is dead prematurely: {e}", self.idx);
				self.mark_dead();
				Err(Error::sys("send", e))
			},
			SendOutcome::Failed(e) => Err(Error::sys("send", e)),
		}
	}

	pub(crate) fn mark_dead(&mut self) {
		self.state.insert(ConnState::ERROR | ConnState::DISCONNECTION);
	}

	pub(crate) fn is_marked_dead(&self) -> bool {
		self.state
			.contains(ConnState::ERROR | ConnState::DISCONNECTION)
	}
}

enum SendOutcome {
	Sent(usize),
	GaveUp,
	/// Zero-byte send result: the peer is gone.
	PeerGone,
	/// EPIPE: close the connection.
	Broken(io::Error),
	Failed(io::Error),
}

fn send_chunked(
	sock: &Socket,
	stream: bool,
	remote: Option<&Endpoint>,
	data: &[u8],
) -> SendOutcome {
	let mut chunk = data.len();
	loop {
		let r = if stream {
			sock.send_with_flags(&data[..chunk], libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
		} else if let Some(ep) = remote {
			sock.send_to_with_flags(&data[..chunk], &ep.kernel_addr(), libc::MSG_NOSIGNAL)
		} else {
			sock.send_with_flags(&data[..chunk], libc::MSG_NOSIGNAL)
		};
		match r {
			Ok(0) => return SendOutcome::PeerGone,
			Ok(n) => return SendOutcome::Sent(n),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				if chunk < 10 {
					return SendOutcome::GaveUp;
				}
				chunk /= 2;
			},
			Err(e) if e.raw_os_error() == Some(libc::EPIPE) => return SendOutcome::Broken(e),
			Err(e) => return SendOutcome::Failed(e),
		}
	}
}
