//! Outbound connections.

use std::time::Duration;

use socket2::Socket;
use tracing::debug;

use crate::clock::Deadline;
use crate::conn::ConnFlags;
use crate::endpoint::{Endpoint, Family};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolFlags};
use crate::signal::{PoolHandler, Signal};

impl<H: PoolHandler> Pool<H> {
	/// Connects to a textual address, auto-detecting the family when
	/// `family` is [`Family::Any`]. `ttl` zero keeps the connection
	/// persistent. Returns the slot index.
	pub fn connect_text(
		&mut self,
		flags: ConnFlags,
		text: &str,
		family: Family,
		port: u16,
		ttl: Duration,
	) -> Result<usize> {
		let remote = Endpoint::from_text(family, text, port)?;
		self.connect_endpoint(flags, remote, ttl)
	}

	/// Connects to a host-order numeric IPv4 address.
	pub fn connect_v4(
		&mut self,
		flags: ConnFlags,
		addr: u32,
		port: u16,
		ttl: Duration,
	) -> Result<usize> {
		let remote = Endpoint::v4(addr, port)?;
		self.connect_endpoint(flags, remote, ttl)
	}

	/// Connects to a numeric IPv6 address.
	pub fn connect_v6(
		&mut self,
		flags: ConnFlags,
		addr: [u8; 16],
		port: u16,
		ttl: Duration,
	) -> Result<usize> {
		let remote = Endpoint::v6(addr, port)?;
		self.connect_endpoint(flags, remote, ttl)
	}

	pub(crate) fn connect_endpoint(
		&mut self,
		flags: ConnFlags,
		remote: Endpoint,
		ttl: Duration,
	) -> Result<usize> {
		let idx = self.find_free_slot()?;
		self.pre_connect(idx, flags)?;
		// outbound connections carry their own TTL, not the pool default
		self.conns[idx].expire = Deadline::from_ttl(ttl);
		self.conns[idx].remote = Some(remote);
		self.do_connect(idx)
	}

	fn do_connect(&mut self, idx: usize) -> Result<usize> {
		let Some(remote) = self.conns[idx].remote else {
			return Err(self.connect_failed(idx, "connect", std::io::Error::other("no remote")));
		};
		let stream = self.flags.contains(PoolFlags::TCP);
		let domain = match remote.family() {
			Family::V6 => socket2::Domain::IPV6,
			_ => socket2::Domain::IPV4,
		};
		let ty = if stream {
			socket2::Type::STREAM
		} else {
			socket2::Type::DGRAM
		};

		let sock = match Socket::new(domain, ty, None) {
			Ok(s) => s,
			Err(e) => return Err(self.connect_failed(idx, "socket", e)),
		};
		if !stream {
			// lock the datagram socket to a local address of the right family
			let local = Endpoint::any(remote.family(), 0);
			if let Err(e) = sock.bind(&local.kernel_addr()) {
				return Err(self.connect_failed(idx, "bind", e));
			}
		}
		if let Err(e) = sock.connect(&remote.kernel_addr()) {
			return Err(self.connect_failed(idx, "connect", e));
		}
		match sock.local_addr() {
			Ok(local) => self.conns[idx].local = local.as_socket().map(Endpoint::from),
			Err(e) => return Err(self.connect_failed(idx, "getsockname", e)),
		}
		if let Err(e) = sock.set_nonblocking(true) {
			return Err(self.connect_failed(idx, "fcntl", e));
		}
		self.conns[idx].sock = Some(sock);

		if self.notifier.is_some() {
			let fd = self.conns[idx].fd();
			let registered = match (self.notifier.as_ref(), fd) {
				(Some(notifier), Some(fd)) => {
					notifier.add(fd, self.flags.contains(PoolFlags::ASYNC))
				},
				_ => Ok(()),
			};
			if let Err(e) = registered {
				self.unwind_pre_connect(idx);
				return Err(e);
			}
		}

		if !self.conns[idx].flags.contains(ConnFlags::UDP_IN) {
			self.emit(idx, Signal::Connected);
			debug!("outbound connection #{idx} initiated");
		}
		self.conns[idx].unlock();
		Ok(idx)
	}

	fn connect_failed(&mut self, idx: usize, site: &'static str, err: std::io::Error) -> Error {
		self.unwind_pre_connect(idx);
		Error::sys(site, err)
	}
}
