//! Tagged socket addresses.
//!
//! In-core the address is a plain `SocketAddr` variant; the conversion to
//! [`socket2::SockAddr`] at the kernel boundary is where network byte order
//! is applied.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::SockAddr;

use crate::error::{Error, Result};

/// Address family selector for text parsing. `Any` tries IPv6 first, then
/// IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
	V4,
	V6,
	Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
	V4(SocketAddrV4),
	V6(SocketAddrV6),
}

impl Endpoint {
	/// Parses a textual IP address. With a concrete family hint the text must
	/// be of that family; with [`Family::Any`] the family is auto-detected.
	pub fn from_text(family: Family, text: &str, port: u16) -> Result<Endpoint> {
		let bad = || Error::msg(format!("bad address: {text}"));
		match family {
			Family::V6 => text
				.parse::<Ipv6Addr>()
				.map(|ip| Endpoint::V6(SocketAddrV6::new(ip, port, 0, 0)))
				.map_err(|_| bad()),
			Family::V4 => text
				.parse::<Ipv4Addr>()
				.map(|ip| Endpoint::V4(SocketAddrV4::new(ip, port)))
				.map_err(|_| bad()),
			Family::Any => {
				if let Ok(ip) = text.parse::<Ipv6Addr>() {
					Ok(Endpoint::V6(SocketAddrV6::new(ip, port, 0, 0)))
				} else if let Ok(ip) = text.parse::<Ipv4Addr>() {
					Ok(Endpoint::V4(SocketAddrV4::new(ip, port)))
				} else {
					Err(bad())
				}
			},
		}
	}

	/// Numeric IPv4 endpoint. The address is given in host order, exactly as
	/// `INADDR_LOOPBACK`-style constants are written.
	pub fn v4(addr: u32, port: u16) -> Result<Endpoint> {
		check_port(port)?;
		Ok(Endpoint::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port)))
	}

	/// Numeric IPv6 endpoint from the 16 address octets.
	pub fn v6(addr: [u8; 16], port: u16) -> Result<Endpoint> {
		check_port(port)?;
		Ok(Endpoint::V6(SocketAddrV6::new(
			Ipv6Addr::from(addr),
			port,
			0,
			0,
		)))
	}

	/// Wildcard endpoint of the given family, used for local binds.
	pub fn any(family: Family, port: u16) -> Endpoint {
		match family {
			Family::V6 => Endpoint::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
			_ => Endpoint::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
		}
	}

	pub fn family(&self) -> Family {
		match self {
			Endpoint::V4(_) => Family::V4,
			Endpoint::V6(_) => Family::V6,
		}
	}

	pub fn port(&self) -> u16 {
		match self {
			Endpoint::V4(a) => a.port(),
			Endpoint::V6(a) => a.port(),
		}
	}

	pub fn set_port(&mut self, port: u16) {
		match self {
			Endpoint::V4(a) => a.set_port(port),
			Endpoint::V6(a) => a.set_port(port),
		}
	}

	pub fn addr(&self) -> SocketAddr {
		match self {
			Endpoint::V4(a) => SocketAddr::V4(*a),
			Endpoint::V6(a) => SocketAddr::V6(*a),
		}
	}

	/// IP + port comparison, ignoring IPv6 flow/scope metadata the kernel may
	/// have attached to one side.
	pub fn same_addr(&self, other: &Endpoint) -> bool {
		self.addr().ip() == other.addr().ip() && self.port() == other.port()
	}

	pub(crate) fn kernel_addr(&self) -> SockAddr {
		SockAddr::from(self.addr())
	}
}

impl From<SocketAddr> for Endpoint {
	fn from(addr: SocketAddr) -> Endpoint {
		match addr {
			SocketAddr::V4(a) => Endpoint::V4(a),
			SocketAddr::V6(a) => Endpoint::V6(a),
		}
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.addr())
	}
}

fn check_port(port: u16) -> Result<()> {
	if port == 0 {
		return Err(Error::msg("bad port: 0"));
	}
	Ok(())
}
