//! Connection pool: slot array + optional listener + readiness notifier.

mod accept;
mod connect;
mod io;
mod poll;
mod resize;

use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use socket2::Socket;
use tracing::{error, info};

use crate::clock::Deadline;
use crate::conn::{Conn, ConnFlags, ConnState};
use crate::endpoint::{Endpoint, Family};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::signal::{PoolHandler, Signal};

pub use io::RecvStatus;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct PoolFlags: u32 {
		/// Stream transport. Absent means the pool is UDP.
		const TCP = 1;
		/// Fully asynchronous I/O: sends never block and sockets are polled
		/// for write readiness (`CanSend`).
		const ASYNC = 2;
		/// IPv6 listener/server mode. Absent means IPv4.
		const IPV6 = 4;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
	Tcp,
	Udp,
}

mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

/// Pool construction parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
	pub transport: Transport,
	#[serde(default)]
	pub ipv6: bool,
	#[serde(default)]
	pub async_io: bool,
	/// Simultaneous connection slots. Resizable later via [`Pool::resize`].
	pub max_connections: usize,
	/// Default expiration applied to newly accepted connections; zero keeps
	/// them persistent. Outbound connections carry their own TTL.
	#[serde(default, with = "serde_dur")]
	pub conn_ttl: Duration,
	/// Receive buffer size per slot. Must not be zero.
	pub buf_size: usize,
}

impl PoolConfig {
	pub fn flags(&self) -> PoolFlags {
		let mut flags = PoolFlags::empty();
		if self.transport == Transport::Tcp {
			flags |= PoolFlags::TCP;
		}
		if self.ipv6 {
			flags |= PoolFlags::IPV6;
		}
		if self.async_io {
			flags |= PoolFlags::ASYNC;
		}
		flags
	}
}

/// Counters accumulated over the pool's lifetime.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
	/// Connections that ever occupied a slot.
	pub conn_count: u64,
	/// Expiration closes.
	pub timedout: u64,
	/// Admissions dropped because no slot was free.
	pub queue_full_count: u64,
	/// Sum of the occupancy observed at each new connection;
	/// `active_conn_count / conn_count` is the mean occupancy.
	pub active_conn_count: u64,
	/// Cumulative connected time of closed connections.
	pub total_time: Duration,
}

pub(crate) struct Listener {
	pub(crate) sock: Option<Socket>,
	pub(crate) endpoint: Option<Endpoint>,
}

pub struct Pool<H: PoolHandler> {
	pub(crate) conns: Vec<Conn>,
	pub(crate) used_slots: usize,
	pub(crate) flags: PoolFlags,
	state: ConnState,
	pub(crate) notifier: Option<Notifier>,
	pub(crate) max_conn_ttl: Duration,
	pub(crate) listener: Listener,
	pub(crate) handler: H,
	pub(crate) stats: PoolStats,
}

impl<H: PoolHandler> Pool<H> {
	/// Creates a pool with `config.max_connections` empty slots. The handler
	/// receives `Created` for each of them.
	pub fn new(config: &PoolConfig, handler: H) -> Result<Pool<H>> {
		if config.buf_size == 0 {
			return Err(Error::msg("connection buffer size must not be zero"));
		}
		let mut pool = Pool {
			conns: Vec::new(),
			used_slots: 0,
			flags: config.flags(),
			state: ConnState::empty(),
			notifier: None,
			max_conn_ttl: config.conn_ttl,
			listener: Listener {
				sock: None,
				endpoint: None,
			},
			handler,
			stats: PoolStats::default(),
		};
		pool.resize(config.max_connections, config.buf_size)?;
		Ok(pool)
	}

	pub fn flags(&self) -> PoolFlags {
		self.flags
	}

	pub fn max_connections(&self) -> usize {
		self.conns.len()
	}

	pub fn used_slots(&self) -> usize {
		self.used_slots
	}

	pub fn stats(&self) -> &PoolStats {
		&self.stats
	}

	pub fn conn(&self, idx: usize) -> Option<&Conn> {
		self.conns.get(idx)
	}

	pub fn conn_mut(&mut self, idx: usize) -> Option<&mut Conn> {
		self.conns.get_mut(idx)
	}

	pub fn notifier(&self) -> Option<&Notifier> {
		self.notifier.as_ref()
	}

	/// Access to the notifier's behavioural switches (`debug`,
	/// `emit_old_data_signal`). Only present after `listener_create` or the
	/// first operation needing one.
	pub fn notifier_mut(&mut self) -> Option<&mut Notifier> {
		self.notifier.as_mut()
	}

	pub fn listener_endpoint(&self) -> Option<Endpoint> {
		self.listener.endpoint
	}

	/// Sets the listener address from text. The family is dictated by the
	/// pool's `IPV6` flag.
	pub fn set_listener_text(&mut self, text: &str, port: u16) -> Result<()> {
		let family = if self.flags.contains(PoolFlags::IPV6) {
			Family::V6
		} else {
			Family::V4
		};
		self.listener.endpoint = Some(Endpoint::from_text(family, text, port)?);
		Ok(())
	}

	/// Sets the listener address from a host-order IPv4 address.
	pub fn set_listener_v4(&mut self, addr: u32, port: u16) -> Result<()> {
		if self.flags.contains(PoolFlags::IPV6) {
			return Err(Error::BadProto);
		}
		self.listener.endpoint = Some(Endpoint::v4(addr, port)?);
		Ok(())
	}

	pub fn set_listener_v6(&mut self, addr: [u8; 16], port: u16) -> Result<()> {
		if !self.flags.contains(PoolFlags::IPV6) {
			return Err(Error::BadProto);
		}
		self.listener.endpoint = Some(Endpoint::v6(addr, port)?);
		Ok(())
	}

	/// Creates, binds and registers the listening socket.
	///
	/// Binding is retried up to `max_tries` times with `retry_sleep` pauses,
	/// tolerating interfaces that come up after process start. The socket is
	/// switched to non-blocking, the notifier is recreated with the listener
	/// registered, and TCP pools start listening with a backlog equal to the
	/// pool capacity. Binding to port 0 is allowed; the effective address is
	/// read back and available via [`Pool::listener_endpoint`].
	pub fn listener_create(&mut self, max_tries: u32, retry_sleep: Duration) -> Result<()> {
		if self.listener.sock.is_some() {
			return Err(Error::msg("listener is already active"));
		}
		let family = if self.flags.contains(PoolFlags::IPV6) {
			Family::V6
		} else {
			Family::V4
		};
		let endpoint = self.listener.endpoint.unwrap_or(Endpoint::any(family, 0));
		let domain = match endpoint.family() {
			Family::V6 => socket2::Domain::IPV6,
			_ => socket2::Domain::IPV4,
		};
		let ty = if self.flags.contains(PoolFlags::TCP) {
			socket2::Type::STREAM
		} else {
			socket2::Type::DGRAM
		};
		let sock = Socket::new(domain, ty, None).map_err(|e| Error::sys("socket", e))?;

		let mut tries_left = max_tries;
		loop {
			match sock.bind(&endpoint.kernel_addr()) {
				Ok(()) => break,
				Err(e) => {
					tries_left = tries_left.saturating_sub(1);
					if tries_left == 0 {
						return Err(Error::sys("bind", e));
					}
					tracing::warn!(
						error = %e,
						retries_left = tries_left,
						"bind failed, sleeping for {:?}",
						retry_sleep
					);
					thread::sleep(retry_sleep);
				},
			}
		}

		sock.set_nonblocking(true).map_err(|e| Error::sys("fcntl", e))?;
		if let Ok(local) = sock.local_addr() {
			if let Some(sa) = local.as_socket() {
				self.listener.endpoint = Some(Endpoint::from(sa));
			}
		}
		self.listener.sock = Some(sock);

		// any previous notifier is dropped together with its registrations
		self.notifier = None;
		if let Err(e) = self.create_notifier() {
			self.listener.sock = None;
			return Err(e);
		}

		if self.flags.contains(PoolFlags::TCP) {
			let backlog = self.conns.len() as i32;
			let r = match self.listener.sock.as_ref() {
				Some(l) => l.listen(backlog),
				None => Ok(()),
			};
			if let Err(e) = r {
				self.listener.sock = None;
				self.notifier = None;
				return Err(Error::sys("listen", e));
			}
		}
		Ok(())
	}

	/// Builds a fresh notifier and registers the listener plus every live
	/// slot with it.
	pub(crate) fn create_notifier(&mut self) -> Result<()> {
		let listener_fd = self.listener.sock.as_ref().map(|s| s.as_raw_fd());
		let notifier = Notifier::new(listener_fd, self.conns.len())?;
		let want_writable = self.flags.contains(PoolFlags::ASYNC);
		for conn in &self.conns {
			if !conn.state.contains(ConnState::CONNECTED)
				|| conn
					.state
					.intersects(ConnState::ERROR | ConnState::DISCONNECTION)
			{
				continue;
			}
			if let Some(fd) = conn.fd() {
				notifier.add(fd, want_writable)?;
			}
		}
		self.notifier = Some(notifier);
		Ok(())
	}

	/// First slot not holding a connection. Bumps `queue_full_count` and
	/// fails with [`Error::ConnListFull`] when the pool is at capacity.
	pub fn find_free_slot(&mut self) -> Result<usize> {
		if self.used_slots == self.conns.len() {
			self.stats.queue_full_count += 1;
			return Err(Error::ConnListFull);
		}
		match self
			.conns
			.iter()
			.position(|c| !c.state.contains(ConnState::CONNECTED))
		{
			Some(idx) => Ok(idx),
			None => {
				error!("free slot counter does not match slot states");
				Err(Error::ConnListFull)
			},
		}
	}

	pub fn get_conn_by_fd(&self, fd: std::os::fd::RawFd) -> Option<usize> {
		self.conns.iter().position(|c| c.fd() == Some(fd))
	}

	/// First slot whose local (or remote) port matches.
	pub fn get_conn_by_port(&self, port: u16, local: bool) -> Option<usize> {
		self.conns.iter().position(|c| {
			let side = if local { c.local } else { c.remote };
			side.is_some_and(|ep| ep.port() == port)
		})
	}

	/// First slot whose local (or remote) address and port match.
	pub fn get_conn_by_address(&self, addr: &std::net::SocketAddr, local: bool) -> Option<usize> {
		let target = Endpoint::from(*addr);
		self.conns.iter().position(|c| {
			let side = if local { c.local } else { c.remote };
			side.is_some_and(|ep| ep.same_addr(&target))
		})
	}

	pub(crate) fn lock(&mut self) -> Result<()> {
		crate::conn::lock_state(&mut self.state)
	}

	pub(crate) fn unlock(&mut self) {
		self.state.remove(ConnState::BUSY);
	}

	/// Reserves a free slot for an incoming or outgoing connection: acquires
	/// the slot lock, stamps creation time, applies the pool TTL, clears the
	/// buffer cursors and marks the slot `CONNECTED`. The caller must clear
	/// `CONNECTED`, unwind `used_slots` and unlock on failure.
	pub(crate) fn pre_connect(&mut self, idx: usize, flags: ConnFlags) -> Result<()> {
		let ttl = self.max_conn_ttl;
		let conn = &mut self.conns[idx];
		conn.lock()?;
		conn.created_at = Instant::now();
		conn.expire = Deadline::from_ttl(ttl);
		conn.sock = None;
		conn.flags = flags;
		conn.bufpos = 0;
		conn.buffill = 0;
		conn.state = ConnState::CONNECTED | ConnState::BUSY;
		self.used_slots += 1;
		self.stats.conn_count += 1;
		self.stats.active_conn_count += self.used_slots as u64;
		Ok(())
	}

	/// Reverses a `pre_connect` whose connection attempt failed.
	pub(crate) fn unwind_pre_connect(&mut self, idx: usize) {
		let conn = &mut self.conns[idx];
		conn.sock = None;
		conn.state.remove(ConnState::CONNECTED);
		conn.unlock();
		self.used_slots -= 1;
	}

	/// Invokes the embedder callback for slot `idx`.
	pub(crate) fn emit(&mut self, idx: usize, signal: Signal) -> bool {
		self.handler.on_signal(&mut self.conns[idx], signal)
	}

	/// Logs a statistics summary.
	pub fn print_stat(&self, intro: &str) {
		let s = &self.stats;
		let avg100 = if s.conn_count > 0 {
			s.active_conn_count * 100 / s.conn_count
		} else {
			0
		};
		info!(
			"pool statistics: {intro}: total conns: {}, avg occupancy: {}.{:02}, timed out: {}, queue full: {} times",
			s.conn_count,
			avg100 / 100,
			avg100 % 100,
			s.timedout,
			s.queue_full_count
		);
		let total_ms = s.total_time.as_millis();
		let avg_ms = if s.conn_count > 0 {
			total_ms / s.conn_count as u128
		} else {
			0
		};
		info!(
			"total connected time: {}.{:03}s, avg per conn: {}.{:03}s",
			total_ms / 1000,
			total_ms % 1000,
			avg_ms / 1000,
			avg_ms % 1000
		);
	}

	fn teardown(&mut self) {
		self.listener.sock = None;
		self.notifier = None;
		for idx in 0..self.conns.len() {
			if self.conns[idx].state.contains(ConnState::CONNECTED) {
				self.close_connection(idx);
			}
		}
		for idx in 0..self.conns.len() {
			self.emit(idx, Signal::Destroying);
		}
		self.conns.clear();
	}
}

impl<H: PoolHandler> Drop for Pool<H> {
	fn drop(&mut self) {
		self.teardown();
	}
}
