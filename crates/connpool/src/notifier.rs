//! Level-triggered readiness notifier over epoll.
//!
//! Attached to a pool it reports the whole ready set per [`Notifier::poll`];
//! standalone embedders can instead call [`Notifier::poll_one`] to receive
//! one fd status per call, cycling through the last batch before refilling.

use std::os::fd::{BorrowedFd, RawFd};

use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{Error, Result};

bitflags! {
	/// Readiness summary for a single descriptor.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct FdStatus: u32 {
		/// The status concerns the listener socket.
		const LISTENER = 1;
		/// Error or hangup detected.
		const ERROR = 2;
		/// Data available from the peer.
		const IN = 4;
		/// Ready to send.
		const OUT = 8;
	}
}

/// One readiness report from [`Notifier::poll`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
	pub fd: RawFd,
	pub readable: bool,
	pub writable: bool,
	/// Error or hangup; the fd is beyond use.
	pub error: bool,
}

impl Event {
	fn from_epoll(ev: &EpollEvent) -> Event {
		let flags = ev.events();
		Event {
			fd: ev.data() as RawFd,
			readable: flags.contains(EpollFlags::EPOLLIN),
			writable: flags.contains(EpollFlags::EPOLLOUT),
			error: flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP),
		}
	}
}

pub struct Notifier {
	epoll: Epoll,
	events: Vec<EpollEvent>,
	batch: usize,
	cursor: usize,
	listener_fd: Option<RawFd>,
	/// Verbose per-event logging in the poll loop.
	pub debug: bool,
	/// Emit `DataLeft` for buffers the embedder has not drained by the end
	/// of a poll cycle. Default true.
	pub emit_old_data_signal: bool,
}

impl Notifier {
	/// Creates the notifier, registering `listener_fd` for read readiness
	/// when given. `max_events` bounds one poll batch (the listener slot is
	/// accounted for on top).
	pub fn new(listener_fd: Option<RawFd>, max_events: usize) -> Result<Notifier> {
		let slots = (max_events + usize::from(listener_fd.is_some())).max(1);
		let epoll =
			Epoll::new(EpollCreateFlags::empty()).map_err(|e| Error::sys("epoll_create", e))?;
		let notifier = Notifier {
			epoll,
			events: (0..slots).map(|_| EpollEvent::empty()).collect(),
			batch: 0,
			cursor: 0,
			listener_fd,
			debug: false,
			emit_old_data_signal: true,
		};
		if let Some(fd) = listener_fd {
			notifier.register(fd, EpollFlags::EPOLLIN)?;
		}
		Ok(notifier)
	}

	/// Starts watching `fd`. Write readiness is only requested when asked
	/// for, so non-ASYNC pools are not woken by permanently-writable sockets.
	pub fn add(&self, fd: RawFd, want_writable: bool) -> Result<()> {
		let mut interest = EpollFlags::EPOLLIN;
		if want_writable {
			interest |= EpollFlags::EPOLLOUT;
		}
		self.register(fd, interest)
	}

	fn register(&self, fd: RawFd, interest: EpollFlags) -> Result<()> {
		let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
		self.epoll
			.add(borrowed, EpollEvent::new(interest, fd as u64))
			.map_err(|e| Error::sys("epoll_ctl(add)", e))
	}

	/// Stops watching `fd`. Removing a descriptor that is already gone from
	/// the set is not an error.
	pub fn remove(&self, fd: RawFd) -> Result<()> {
		let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
		match self.epoll.delete(borrowed) {
			Ok(()) | Err(Errno::ENOENT) => Ok(()),
			Err(e) => Err(Error::sys("epoll_ctl(del)", e)),
		}
	}

	pub fn listener_fd(&self) -> Option<RawFd> {
		self.listener_fd
	}

	/// Collects the current ready set without blocking.
	pub fn poll(&mut self) -> Result<Vec<Event>> {
		let n = self
			.epoll
			.wait(&mut self.events, EpollTimeout::ZERO)
			.map_err(|e| Error::sys("epoll_wait", e))?;
		self.batch = n;
		self.cursor = n; // poll_one will refill on its next call
		Ok(self.events[..n].iter().map(Event::from_epoll).collect())
	}

	/// Standalone mode: returns the status of one ready descriptor per call,
	/// round-robin over the last batch, refilling from the kernel when the
	/// batch is exhausted. An empty status means nothing is ready.
	pub fn poll_one(&mut self) -> Result<FdStatus> {
		if self.cursor >= self.batch {
			self.batch = self
				.epoll
				.wait(&mut self.events, EpollTimeout::ZERO)
				.map_err(|e| Error::sys("epoll_wait", e))?;
			self.cursor = 0;
		}
		if self.batch == 0 {
			return Ok(FdStatus::empty());
		}
		let ev = &self.events[self.cursor];
		self.cursor += 1;
		let mut status = status_bits(ev.events());
		if self.listener_fd == Some(ev.data() as RawFd) {
			status |= FdStatus::LISTENER;
		}
		Ok(status)
	}
}

fn status_bits(flags: EpollFlags) -> FdStatus {
	let mut status = FdStatus::empty();
	if flags.contains(EpollFlags::EPOLLIN) {
		status |= FdStatus::IN;
	}
	if flags.contains(EpollFlags::EPOLLOUT) {
		status |= FdStatus::OUT;
	}
	if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
		status |= FdStatus::ERROR;
	}
	status
}

/// One-shot readiness probe for a bare descriptor: the union of its current
/// readable/writable/error bits.
pub fn single_fd(fd: RawFd) -> Result<FdStatus> {
	let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(|e| Error::sys("epoll_create", e))?;
	let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
	epoll
		.add(
			borrowed,
			EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, fd as u64),
		)
		.map_err(|e| Error::sys("epoll_ctl(add)", e))?;
	let mut events = [EpollEvent::empty()];
	let n = epoll
		.wait(&mut events, EpollTimeout::ZERO)
		.map_err(|e| Error::sys("epoll_wait", e))?;
	if n == 0 {
		return Ok(FdStatus::empty());
	}
	Ok(status_bits(events[0].events()))
}
