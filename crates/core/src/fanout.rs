//! Process-wide table of debug destinations.
//!
//! A destination is a raw fd (a connected client asking for a verbose feed,
//! a pipe to a log viewer, ...). `broadcast` fans a formatted line out to
//! every registered fd, collapsing immediate repeats and pruning sinks whose
//! peer went away. The networking core consults `is_member` before closing a
//! connection so debug feeds are not counted in pool statistics.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use once_cell::sync::Lazy;
use tracing::debug;

/// Repeats of the same line within this window are counted, not re-sent.
const REPEAT_WINDOW: Duration = Duration::from_secs(3);
const MAX_SINKS: usize = 16;

struct Fanout {
	sinks: Vec<RawFd>,
	last_line: String,
	last_at: Option<Instant>,
	repeats: u32,
}

static TABLE: Lazy<Mutex<Fanout>> = Lazy::new(|| {
	Mutex::new(Fanout {
		sinks: Vec::new(),
		last_line: String::new(),
		last_at: None,
		repeats: 0,
	})
});

/// Registers `fd` as a debug destination. Returns false when the table is
/// full or the fd is already present.
pub fn add(fd: RawFd) -> bool {
	let mut t = TABLE.lock().unwrap();
	if t.sinks.len() >= MAX_SINKS || t.sinks.contains(&fd) {
		return false;
	}
	t.sinks.push(fd);
	true
}

/// Deregisters `fd`. Unknown fds are ignored.
pub fn remove(fd: RawFd) {
	let mut t = TABLE.lock().unwrap();
	t.sinks.retain(|s| *s != fd);
}

pub fn is_member(fd: RawFd) -> bool {
	TABLE.lock().unwrap().sinks.contains(&fd)
}

/// Sends `line` to every registered destination.
///
/// A line equal to the previous one within the repeat window only bumps a
/// counter; the next distinct line is preceded by a "last message repeated N
/// times" note. Destinations reporting error/hangup are dropped from the
/// table. The lock is not held across any kernel call.
pub fn broadcast(line: &str) {
	let (targets, note) = {
		let mut t = TABLE.lock().unwrap();
		if t.sinks.is_empty() {
			return;
		}
		let within = t.last_at.is_some_and(|at| at.elapsed() < REPEAT_WINDOW);
		if within && t.last_line == line {
			t.repeats += 1;
			return;
		}
		let note = if t.repeats > 0 {
			Some(format!("last message repeated {} times\n", t.repeats))
		} else {
			None
		};
		t.repeats = 0;
		t.last_line = line.to_string();
		t.last_at = Some(Instant::now());
		(t.sinks.clone(), note)
	};

	let mut dead = Vec::new();
	for fd in targets {
		if !writable(fd) {
			dead.push(fd);
			continue;
		}
		if let Some(n) = &note {
			write_all(fd, n.as_bytes());
		}
		if !write_all(fd, line.as_bytes()) {
			dead.push(fd);
		}
	}

	if !dead.is_empty() {
		let mut t = TABLE.lock().unwrap();
		for fd in dead {
			debug!(fd, "dropping dead debug destination");
			t.sinks.retain(|s| *s != fd);
		}
	}
}

fn writable(fd: RawFd) -> bool {
	// The fd stays registered in the table while we probe it; stale entries
	// are only possible if the owner closed it without calling remove().
	let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
	let mut fds = [PollFd::new(borrowed, PollFlags::POLLOUT)];
	match nix::poll::poll(&mut fds, PollTimeout::ZERO) {
		Ok(_) => {
			let revents = fds[0].revents().unwrap_or(PollFlags::empty());
			!revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
		},
		Err(_) => false,
	}
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> bool {
	while !buf.is_empty() {
		let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
		if n <= 0 {
			return false;
		}
		buf = &buf[n as usize..];
	}
	true
}
