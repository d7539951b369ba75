use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Installs the global subscriber: a compact fmt layer behind a reloadable
/// target filter seeded from `RUST_LOG`.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	tracing_subscriber::registry().with(fmt_layer()).init();
}

fn fmt_layer() -> BoxLayer {
	let format: BoxLayer = Box::new(
		tracing_subscriber::fmt::layer()
			.with_target(true)
			.with_writer(std::io::stdout),
	);
	let (layer, reload) = reload::Layer::new(format.with_filter(default_filter()));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	Box::new(layer)
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or("info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

/// set_level dynamically updates the logging level to *include* level. If `reset` is true, it
/// will reset the entire logging configuration first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		warn!("failed to get log handle");
		return Err(Error::Uninitialized);
	};
	let new_directive = if let Ok(current) = handle.with_current(|f| f.filter().to_string()) {
		if reset {
			if level.is_empty() {
				default_filter().to_string()
			} else {
				format!("{},{}", default_filter(), level)
			}
		} else {
			format!("{current},{level}")
		}
	} else {
		level.to_string()
	};

	let new_filter = filter::Targets::from_str(&new_directive)?;
	info!("new log filter is {new_filter}");

	Ok(handle.modify(|layer| {
		*layer.filter_mut() = new_filter;
	})?)
}

pub fn current_level() -> Result<String, Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		Ok(handle.with_current(|f| f.filter().to_string())?)
	} else {
		Err(Error::Uninitialized)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

/// Test logger that tees every line into an in-memory buffer for querying.
pub mod testing {
	use std::io;
	use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

	use once_cell::sync::Lazy;
	use tracing_subscriber::fmt;
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;

	use super::APPLICATION_START_TIME;

	/// Returns all captured log lines containing `needle`.
	pub fn find(needle: &str) -> Vec<String> {
		let b = global_buf();
		let buf = b.lock().unwrap();
		std::str::from_utf8(&buf)
			.expect("logs contain invalid UTF8")
			.lines()
			.filter(|l| l.contains(needle))
			.map(|l| l.to_string())
			.collect()
	}

	/// MockWriter stores written logs
	#[derive(Debug, Clone)]
	pub struct MockWriter {
		buf: Arc<Mutex<Vec<u8>>>,
	}

	impl MockWriter {
		pub fn new(buf: Arc<Mutex<Vec<u8>>>) -> Self {
			Self { buf }
		}

		fn buf(&self) -> io::Result<MutexGuard<Vec<u8>>> {
			self.buf.lock().map_err(|_| io::Error::other("poisoned"))
		}
	}

	impl io::Write for MockWriter {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			let mut target = self.buf()?;
			target.extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	impl fmt::MakeWriter<'_> for MockWriter {
		type Writer = Self;

		fn make_writer(&self) -> Self::Writer {
			MockWriter::new(self.buf.clone())
		}
	}

	fn global_buf() -> Arc<Mutex<Vec<u8>>> {
		static GLOBAL_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();
		GLOBAL_BUF
			.get_or_init(|| Arc::new(Mutex::new(vec![])))
			.clone()
	}

	static TRACING: Lazy<()> = Lazy::new(setup_test_logging_internal);

	pub fn setup_test_logging() {
		Lazy::force(&TRACING);
	}

	fn setup_test_logging_internal() {
		Lazy::force(&APPLICATION_START_TIME);
		let mock_writer = MockWriter::new(global_buf());
		let layer: fmt::Layer<_, _, _, _> = fmt::layer()
			.with_target(true)
			.with_writer(mock_writer)
			.with_ansi(false);
		tracing_subscriber::registry().with(layer).init();
	}
}
