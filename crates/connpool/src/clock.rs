//! Monotonic deadline arithmetic.

use std::time::{Duration, Instant};

/// A point in monotonic time after which something should happen, or "never".
///
/// A zero TTL maps to [`Deadline::NONE`]: the owning connection is persistent
/// and is not auto-closed on time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
	pub const NONE: Deadline = Deadline(None);

	/// Deadline `d` from now.
	pub fn after(d: Duration) -> Deadline {
		Deadline(Some(Instant::now() + d))
	}

	/// Deadline derived from a connection TTL; zero means persistent.
	pub fn from_ttl(ttl: Duration) -> Deadline {
		if ttl.is_zero() {
			Deadline::NONE
		} else {
			Deadline::after(ttl)
		}
	}

	pub fn is_set(&self) -> bool {
		self.0.is_some()
	}

	pub fn clear(&mut self) {
		self.0 = None;
	}

	/// True when the deadline is set and has been reached. The comparison is
	/// inclusive: a deadline equal to `now` is due.
	pub fn is_due(&self, now: Instant) -> bool {
		self.0.is_some_and(|at| at <= now)
	}

	/// Milliseconds until the deadline, clamped at zero. `None` when unset.
	pub fn remaining_ms(&self, now: Instant) -> Option<u128> {
		self.0.map(|at| at.saturating_duration_since(now).as_millis())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_ttl_is_persistent() {
		let d = Deadline::from_ttl(Duration::ZERO);
		assert!(!d.is_set());
		assert!(!d.is_due(Instant::now()));
	}

	#[test]
	fn due_is_inclusive() {
		let now = Instant::now();
		let d = Deadline(Some(now));
		assert!(d.is_due(now));
		assert!(d.is_due(now + Duration::from_millis(1)));
	}

	#[test]
	fn future_deadline_not_due() {
		let now = Instant::now();
		let d = Deadline::after(Duration::from_secs(60));
		assert!(d.is_set());
		assert!(!d.is_due(now));
		assert!(d.remaining_ms(now).unwrap() > 0);
	}
}
