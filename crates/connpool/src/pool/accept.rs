//! Admission of inbound connections.
//!
//! TCP pools run the usual kernel accept. UDP pools have no kernel accept:
//! the listener peeks one byte to learn the sender, reuses the slot already
//! holding that remote or synthesizes one (flagged `UDP_IN` so its reads are
//! satisfied from the listener queue), and immediately pulls the waiting
//! datagram into the slot's buffer.

use std::mem::MaybeUninit;

use tracing::debug;

use crate::conn::ConnFlags;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::pool::io::RecvStatus;
use crate::pool::{Pool, PoolFlags};
use crate::signal::{PoolHandler, Signal};

impl<H: PoolHandler> Pool<H> {
	/// Admits one pending connection from the listener. Returns the slot
	/// index, or [`Error::AcceptDenied`] when the callback rejected it.
	pub fn accept_connection(&mut self) -> Result<usize> {
		if self.listener.sock.is_none() {
			return Err(Error::msg("pool has no active listener"));
		}
		if self.flags.contains(PoolFlags::TCP) {
			self.accept_tcp()
		} else {
			self.accept_udp()
		}
	}

	fn accept_tcp(&mut self) -> Result<usize> {
		let idx = self.find_free_slot()?;
		self.pre_connect(idx, ConnFlags::empty())?;

		let accepted = match self.listener.sock.as_ref() {
			Some(listener) => listener.accept(),
			None => Err(std::io::Error::other("listener closed")),
		};
		let (sock, addr) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				self.unwind_pre_connect(idx);
				return Err(Error::sys("accept", e));
			},
		};
		if let Err(e) = sock.set_nonblocking(true) {
			self.unwind_pre_connect(idx);
			return Err(Error::sys("fcntl", e));
		}

		let conn = &mut self.conns[idx];
		conn.remote = addr.as_socket().map(Endpoint::from);
		conn.local = self.listener.endpoint;
		conn.sock = Some(sock);
		let fd = conn.fd();

		let registered = if self.notifier.is_none() {
			self.create_notifier()
		} else if let (Some(notifier), Some(fd)) = (self.notifier.as_ref(), fd) {
			notifier.add(fd, self.flags.contains(PoolFlags::ASYNC))
		} else {
			Ok(())
		};
		if let Err(e) = registered {
			self.close_connection(idx);
			return Err(e);
		}

		if !self.emit(idx, Signal::Accepted) {
			self.close_connection(idx);
			return Err(Error::AcceptDenied);
		}

		debug!("got connected at #{idx}");
		self.conns[idx].unlock();
		Ok(idx)
	}

	fn accept_udp(&mut self) -> Result<usize> {
		// peek the datagram at the head of the listener queue to learn the
		// remote without consuming it
		let peeked = match self.listener.sock.as_ref() {
			Some(listener) => {
				let mut probe = [MaybeUninit::<u8>::uninit()];
				listener.recv_from_with_flags(&mut probe, libc::MSG_DONTWAIT | libc::MSG_PEEK)
			},
			None => Err(std::io::Error::other("listener closed")),
		};
		let (_, addr) = peeked.map_err(|e| Error::sys("recvfrom(MSG_PEEK)", e))?;
		let Some(remote) = addr.as_socket() else {
			return Err(Error::BadProto);
		};

		let idx = match self.get_conn_by_address(&remote, false) {
			Some(idx) => idx,
			None => {
				let ttl = self.max_conn_ttl;
				let idx =
					self.connect_endpoint(ConnFlags::UDP_IN, Endpoint::from(remote), ttl)?;
				if !self.emit(idx, Signal::Accepted) {
					self.close_connection(idx);
					return Err(Error::AcceptDenied);
				}
				if let Some(conn) = self.conn(idx) {
					debug!(
						"udp peer admitted at #{idx} from {}",
						conn.remote().map(|e| e.to_string()).unwrap_or_default()
					);
				}
				idx
			},
		};

		// funnel the datagram from the listener queue into this slot; a
		// failed read has already closed the slot, which is not an admission
		// error
		match self.recv(idx) {
			Ok(RecvStatus::Data(_)) => {
				self.emit(idx, Signal::DataIn);
			},
			Ok(_) | Err(_) => {},
		}
		Ok(idx)
	}
}
