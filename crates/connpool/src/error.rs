use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by the pool and its helpers.
#[derive(Error, Debug)]
pub enum Error {
	#[error("{site}: {source}")]
	System {
		site: &'static str,
		#[source]
		source: io::Error,
	},
	#[error("{0}")]
	Message(String),
	#[error("allocation failed")]
	Oom,
	#[error("connection list is full")]
	ConnListFull,
	#[error("invalid connection index {0}")]
	InvalidConnIndex(usize),
	#[error("lock wait timed out")]
	Locked,
	#[error("wrong protocol family")]
	BadProto,
	#[error("connection denied by callback")]
	AcceptDenied,
}

impl Error {
	pub(crate) fn sys(site: &'static str, err: impl Into<io::Error>) -> Error {
		Error::System {
			site,
			source: err.into(),
		}
	}

	pub(crate) fn msg(text: impl Into<String>) -> Error {
		Error::Message(text.into())
	}
}
