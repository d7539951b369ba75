//! The event loop.

use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::clock::Deadline;
use crate::conn::ConnState;
use crate::error::{Error, Result};
use crate::notifier::{self, FdStatus};
use crate::pool::io::RecvStatus;
use crate::pool::{Pool, PoolFlags};
use crate::signal::{PoolHandler, Signal};

/// Grace period granted to half-closed connections without a deadline of
/// their own, so the embedder gets a chance to drain and the slot still goes
/// away.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

impl<H: PoolHandler> Pool<H> {
	/// Runs one cooperative event-loop pass:
	///
	/// 1. close slots whose peer disconnect was reported last cycle,
	/// 2. collect the ready set (zero timeout),
	/// 3. admit pending connections from the listener,
	/// 4. deliver per-slot events (`DataIn`, `CanSend`, half-close, errors),
	/// 5. expire overdue connections (`TimedOut`),
	/// 6. remind the embedder of still-unread bytes (`DataLeft`).
	///
	/// Peer shutdowns observed in step 4 are only reaped at step 1 of the
	/// *next* pass, giving the callback a full cycle to consume buffered
	/// bytes. An error returned here means the loop itself is broken
	/// (notifier failure, dead listener); per-connection errors just close
	/// the offending slot.
	pub fn poll(&mut self) -> Result<()> {
		for idx in 0..self.conns.len() {
			if self.conns[idx].state.contains(ConnState::DISCONNECTION) {
				self.close_connection(idx);
			}
		}

		if self.notifier.is_none() {
			self.create_notifier()?;
		}
		let (events, debug_events, emit_old_data) = match self.notifier.as_mut() {
			Some(notifier) => (
				notifier.poll()?,
				notifier.debug,
				notifier.emit_old_data_signal,
			),
			None => return Err(Error::msg("pool has no notifier")),
		};
		if debug_events && !events.is_empty() {
			debug!("poll: {} events", events.len());
		}

		let listener_fd = self.listener.sock.as_ref().map(|s| s.as_raw_fd());
		if let Some(listener_fd) = listener_fd {
			if let Some(ev) = events.iter().find(|ev| ev.fd == listener_fd) {
				if ev.error {
					return Err(Error::msg("readiness error/hangup on listener socket"));
				}
				match self.accept_connection() {
					Ok(idx) => {
						if debug_events {
							trace!("accepted at #{idx}");
						}
					},
					Err(Error::AcceptDenied) => {
						if debug_events {
							trace!("accept denied by callback");
						}
					},
					Err(e) => return Err(e),
				}
			}
		}

		for ev in &events {
			if Some(ev.fd) == listener_fd {
				continue;
			}
			let slot = self
				.get_conn_by_fd(ev.fd)
				.filter(|&idx| self.conns[idx].state.contains(ConnState::CONNECTED));
			let Some(idx) = slot else {
				// stale registration: the fd belongs to no live slot
				if let Some(notifier) = self.notifier.as_ref() {
					let _ = notifier.remove(ev.fd);
				}
				if debug_events {
					trace!("dropped stale event for fd {}", ev.fd);
				}
				continue;
			};

			if ev.error {
				self.conns[idx].state.insert(ConnState::ERROR);
				self.close_connection(idx);
				continue;
			}

			if ev.readable {
				match self.recv(idx)? {
					RecvStatus::Data(n) => {
						if debug_events {
							trace!("data in #{idx}: {n} bytes");
						}
						self.emit(idx, Signal::DataIn);
					},
					RecvStatus::BufferFull => {
						if debug_events {
							trace!("buffer full on #{idx}");
						}
					},
					RecvStatus::NoData => {},
					RecvStatus::Disconnected => {
						if debug_events {
							trace!("peer disconnect on #{idx}");
						}
						// stop watching the half-closed fd now, close next
						// cycle after the embedder had a look
						if let (Some(notifier), Some(fd)) =
							(self.notifier.as_ref(), self.conns[idx].fd())
						{
							let _ = notifier.remove(fd);
						}
						self.conns[idx].state.insert(ConnState::DISCONNECTION);
						if !self.conns[idx].expire.is_set() {
							self.conns[idx].expire = Deadline::after(DISCONNECT_GRACE);
						}
						if self.conns[idx].bufpos < self.conns[idx].buffill {
							self.emit(idx, Signal::DataLeft);
						}
						continue;
					},
				}
			}

			if ev.writable
				&& self.flags.contains(PoolFlags::ASYNC)
				&& self.conns[idx].state.contains(ConnState::CONNECTED)
			{
				self.emit(idx, Signal::CanSend);
			}
		}

		let now = Instant::now();
		for idx in 0..self.conns.len() {
			if !self.conns[idx].state.contains(ConnState::CONNECTED) {
				continue;
			}
			if self.conns[idx].expire.is_due(now) {
				self.conns[idx].state.insert(ConnState::EXPIRED);
				self.stats.timedout += 1;
				self.emit(idx, Signal::TimedOut);
				self.close_connection(idx);
				if debug_events {
					trace!("expired #{idx}");
				}
				continue;
			}
			if emit_old_data && self.conns[idx].bufpos < self.conns[idx].buffill {
				self.emit(idx, Signal::DataLeft);
			}
		}

		Ok(())
	}

	/// Error-only sweep: closes connections whose descriptor reports
	/// error/hangup, without reading anything. Usable where a full
	/// [`Pool::poll`] is too much, e.g. from an `EPIPE` signal handler.
	pub fn check_conns(&mut self) -> Result<()> {
		if self.notifier.is_none() {
			self.create_notifier()?;
		}
		let events = match self.notifier.as_mut() {
			Some(notifier) => notifier.poll()?,
			None => return Ok(()),
		};
		let listener_fd = self.listener.sock.as_ref().map(|s| s.as_raw_fd());
		for ev in events {
			if !ev.error {
				continue;
			}
			if Some(ev.fd) == listener_fd {
				return Err(Error::msg("listener died"));
			}
			match self
				.get_conn_by_fd(ev.fd)
				.filter(|&idx| self.conns[idx].state.contains(ConnState::CONNECTED))
			{
				None => {
					if let Some(notifier) = self.notifier.as_ref() {
						notifier.remove(ev.fd)?;
					}
				},
				Some(idx) => {
					self.conns[idx].state.insert(ConnState::ERROR);
					self.close_connection(idx);
				},
			}
		}
		Ok(())
	}

	/// Probes one connection: returns its state bits augmented with current
	/// readiness (`IN`/`OUT`/`ERROR`), or an empty set for free slots.
	/// An overdue connection is closed on the spot.
	pub fn connection_is_alive(&mut self, idx: usize) -> ConnState {
		if idx >= self.conns.len() || !self.conns[idx].state.contains(ConnState::CONNECTED) {
			return ConnState::empty();
		}
		if self.conns[idx].expire.is_due(Instant::now()) {
			self.stats.timedout += 1;
			self.close_connection(idx);
			return ConnState::empty();
		}
		let Some(fd) = self.conns[idx].fd() else {
			return ConnState::ERROR;
		};
		match notifier::single_fd(fd) {
			Err(_) => ConnState::ERROR,
			Ok(status) => {
				let mut state = ConnState::CONNECTED;
				if status.contains(FdStatus::ERROR) {
					state |= ConnState::ERROR;
				}
				if status.contains(FdStatus::IN) {
					state |= ConnState::IN;
				}
				if status.contains(FdStatus::OUT) {
					state |= ConnState::OUT;
				}
				state
			},
		}
	}
}
