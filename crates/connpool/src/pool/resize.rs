//! Growing, shrinking and moving connections between pools.

use tracing::debug;

use crate::conn::{Conn, ConnState};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolFlags};
use crate::signal::{PoolHandler, Signal};

impl<H: PoolHandler> Pool<H> {
	/// Changes the pool capacity to `new_max` slots; newly added slots get a
	/// `new_bufsize`-byte receive buffer.
	///
	/// Shrinking below the live connection count fails with
	/// [`Error::ConnListFull`]. Otherwise live connections in the doomed tail
	/// are defragmented into the lowest free slots (`MovedTo`/`MovedFrom`
	/// emitted per move), the tail is destroyed (`Destroying`), and any new
	/// slots announce themselves with `Created`. After a successful shrink
	/// the live connections occupy a prefix of the slot array.
	pub fn resize(&mut self, new_max: usize, new_bufsize: usize) -> Result<()> {
		if new_max == self.conns.len() {
			return Ok(());
		}
		if new_max < self.used_slots {
			debug!(
				new_max,
				used = self.used_slots,
				"cannot downsize pool below live connection count"
			);
			return Err(Error::ConnListFull);
		}
		self.lock()?;
		let r = self.resize_locked(new_max, new_bufsize);
		self.unlock();
		r
	}

	/// Resize body for callers that already hold the pool lock.
	pub(crate) fn resize_locked(&mut self, new_max: usize, new_bufsize: usize) -> Result<()> {
		if new_max == self.conns.len() {
			return Ok(());
		}
		for i in 0..self.conns.len() {
			if let Err(e) = self.conns[i].lock() {
				for j in 0..i {
					self.conns[j].unlock();
				}
				return Err(e);
			}
		}
		let result = self.apply_resize(new_max, new_bufsize);
		for i in 0..self.conns.len() {
			self.conns[i].unlock();
		}
		result
	}

	fn apply_resize(&mut self, new_max: usize, new_bufsize: usize) -> Result<()> {
		let old_max = self.conns.len();

		if new_max < old_max {
			for i in new_max..old_max {
				if !self.conns[i].state.contains(ConnState::CONNECTED) {
					continue;
				}
				// a free low slot exists because used_slots <= new_max
				let Some(free) = (0..new_max)
					.find(|&n| !self.conns[n].state.contains(ConnState::CONNECTED))
				else {
					continue;
				};
				let (head, tail) = self.conns.split_at_mut(i);
				head[free].copy_from(&mut tail[0]);
				self.conns[i].state.remove(ConnState::CONNECTED);
				self.emit(free, Signal::MovedTo);
				self.emit(i, Signal::MovedFrom);
			}
			for i in new_max..old_max {
				self.emit(i, Signal::Destroying);
			}
			self.conns.truncate(new_max);
		}

		if new_max > old_max {
			self.conns
				.try_reserve_exact(new_max - old_max)
				.map_err(|_| Error::Oom)?;
			let stream = self.flags.contains(PoolFlags::TCP);
			let nonblocking_send = self.flags.contains(PoolFlags::ASYNC);
			for i in old_max..new_max {
				let conn = Conn::new(i, new_bufsize, stream, nonblocking_send)?;
				self.conns.push(conn);
				self.emit(i, Signal::Created);
			}
		}
		Ok(())
	}

	/// Takes over the connection at `src_idx` of `src`.
	///
	/// The destination grows by one slot when full. The source slot is
	/// vacated (`MovedFrom`), the descriptor moves to this pool's notifier,
	/// and the adopted slot reports `MovedTo`. Returns the destination index.
	pub fn move_conn_from<S: PoolHandler>(
		&mut self,
		src: &mut Pool<S>,
		src_idx: usize,
	) -> Result<usize> {
		if src_idx >= src.conns.len() || !src.conns[src_idx].state.contains(ConnState::CONNECTED) {
			return Err(Error::InvalidConnIndex(src_idx));
		}
		self.lock()?;
		if self.used_slots == self.conns.len() {
			let bufsize = self
				.conns
				.first()
				.map(|c| c.bufsize())
				.unwrap_or(src.conns[src_idx].bufsize());
			if let Err(e) = self.resize_locked(self.conns.len() + 1, bufsize) {
				self.unlock();
				return Err(e);
			}
		}
		if let Err(e) = src.lock() {
			self.unlock();
			return Err(e);
		}

		let dst_idx = match self
			.conns
			.iter()
			.position(|c| !c.state.contains(ConnState::CONNECTED))
		{
			Some(i) => i,
			None => {
				src.unlock();
				self.unlock();
				return Err(Error::ConnListFull);
			},
		};

		let fd = src.conns[src_idx].fd();
		self.conns[dst_idx].copy_from(&mut src.conns[src_idx]);

		if let (Some(notifier), Some(fd)) = (src.notifier.as_ref(), fd) {
			let _ = notifier.remove(fd);
		}
		src.conns[src_idx].state.remove(ConnState::CONNECTED);
		src.used_slots -= 1;
		src.emit(src_idx, Signal::MovedFrom);

		self.used_slots += 1;
		let registered = if self.notifier.is_none() {
			self.create_notifier()
		} else if let (Some(notifier), Some(fd)) = (self.notifier.as_ref(), fd) {
			notifier.add(fd, self.flags.contains(PoolFlags::ASYNC))
		} else {
			Ok(())
		};
		if let Err(e) = registered {
			src.unlock();
			self.unlock();
			return Err(e);
		}
		self.emit(dst_idx, Signal::MovedTo);

		// both pools stay locked until the whole move is visible
		src.unlock();
		self.unlock();
		debug!(src_idx, dst_idx, "connection moved between pools");
		Ok(dst_idx)
	}
}
