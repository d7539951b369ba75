//! End-to-end scenarios against real loopback peers.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use connpool::{
	Conn, ConnFlags, ConnState, Error, Pool, PoolConfig, PoolHandler, RecvStatus, Signal,
	Transport,
};
use connpool_core::telemetry;

#[derive(Default)]
struct Trace {
	events: Vec<(usize, Signal)>,
	payloads: Vec<Vec<u8>>,
}

impl Trace {
	fn count(&self, signal: Signal) -> usize {
		self.events.iter().filter(|(_, s)| *s == signal).count()
	}

	fn position(&self, idx: usize, signal: Signal) -> Option<usize> {
		self.events.iter().position(|e| *e == (idx, signal))
	}
}

/// Test handler: records every signal, optionally consumes and echoes
/// incoming bytes, optionally denies admission.
struct Recorder {
	trace: Rc<RefCell<Trace>>,
	echo: bool,
	consume: bool,
	deny: bool,
}

impl PoolHandler for Recorder {
	fn on_signal(&mut self, conn: &mut Conn, signal: Signal) -> bool {
		self.trace.borrow_mut().events.push((conn.index(), signal));
		if signal == Signal::DataIn {
			let data = conn.data().to_vec();
			if self.consume {
				conn.advance(data.len());
			}
			self.trace.borrow_mut().payloads.push(data.clone());
			if self.echo {
				conn.send(&data).expect("echo send");
			}
		}
		!(signal == Signal::Accepted && self.deny)
	}
}

fn recorder(echo: bool, consume: bool, deny: bool) -> (Recorder, Rc<RefCell<Trace>>) {
	let trace: Rc<RefCell<Trace>> = Default::default();
	(
		Recorder {
			trace: trace.clone(),
			echo,
			consume,
			deny,
		},
		trace,
	)
}

fn config(transport: Transport, max: usize, ttl: Duration, buf: usize) -> PoolConfig {
	PoolConfig {
		transport,
		ipv6: false,
		async_io: false,
		max_connections: max,
		conn_ttl: ttl,
		buf_size: buf,
	}
}

fn listening_pool(
	cfg: &PoolConfig,
	handler: Recorder,
) -> (Pool<Recorder>, u16) {
	let mut pool = Pool::new(cfg, handler).expect("pool");
	pool.set_listener_text("127.0.0.1", 0).expect("listener addr");
	pool
		.listener_create(1, Duration::ZERO)
		.expect("listener create");
	let port = pool.listener_endpoint().expect("bound endpoint").port();
	(pool, port)
}

/// Drives the pool until `done` observes what it wants or the cycle budget
/// runs out.
fn pump_until<H: PoolHandler>(
	pool: &mut Pool<H>,
	trace: &Rc<RefCell<Trace>>,
	mut done: impl FnMut(&Trace) -> bool,
) -> bool {
	for _ in 0..400 {
		pool.poll().expect("poll");
		if done(&trace.borrow()) {
			return true;
		}
		thread::sleep(Duration::from_millis(5));
	}
	false
}

#[test]
fn tcp_echo_round_trip() {
	telemetry::testing::setup_test_logging();
	let (handler, trace) = recorder(true, true, false);
	let cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
	client
		.set_read_timeout(Some(Duration::from_secs(5)))
		.expect("timeout");
	client.write_all(b"hello\n").expect("write");

	assert!(pump_until(&mut pool, &trace, |t| {
		t.payloads.iter().any(|p| p == b"hello\n")
	}));

	let mut echoed = [0u8; 6];
	client.read_exact(&mut echoed).expect("read echo");
	assert_eq!(&echoed, b"hello\n");

	let t = trace.borrow();
	assert_eq!(t.count(Signal::Accepted), 1);
	assert_eq!(t.count(Signal::DataIn), 1);
	drop(t);
	assert_eq!(pool.used_slots(), 1);
	assert_eq!(pool.stats().conn_count, 1);
	pool.print_stat("tcp echo");
	assert!(!telemetry::testing::find("tcp echo").is_empty());
}

#[test]
fn udp_pseudo_accept_and_expiry() {
	let ttl = Duration::from_millis(400);
	let (handler, trace) = recorder(false, true, false);
	let cfg = config(Transport::Udp, 4, ttl, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let client = UdpSocket::bind("127.0.0.1:0").expect("client bind");
	client
		.send_to(b"PING", ("127.0.0.1", port))
		.expect("send PING");

	assert!(pump_until(&mut pool, &trace, |t| {
		t.payloads.iter().any(|p| p == b"PING")
	}));
	{
		let t = trace.borrow();
		assert_eq!(t.count(Signal::Accepted), 1);
		let accepted = t.position(0, Signal::Accepted).unwrap();
		let data_in = t.position(0, Signal::DataIn).unwrap();
		assert!(accepted < data_in, "admission precedes data delivery");
	}
	assert_eq!(pool.used_slots(), 1);

	// second datagram from the same endpoint reuses the slot
	client
		.send_to(b"PING2", ("127.0.0.1", port))
		.expect("send PING2");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.payloads.iter().any(|p| p == b"PING2")
	}));
	assert_eq!(trace.borrow().count(Signal::Accepted), 1);
	assert_eq!(pool.used_slots(), 1);

	// silence past the TTL expires the pseudo-connection
	thread::sleep(ttl + Duration::from_millis(50));
	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::Closing) == 1
	}));
	{
		let t = trace.borrow();
		let timed_out = t.position(0, Signal::TimedOut).unwrap();
		let closing = t.position(0, Signal::Closing).unwrap();
		assert!(timed_out < closing);
	}
	assert_eq!(pool.used_slots(), 0);
	assert_eq!(pool.stats().timedout, 1);
}

#[test]
fn accept_denial_closes_inside_accept() {
	let (handler, trace) = recorder(false, false, true);
	let cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::Closing) == 1
	}));

	let t = trace.borrow();
	assert_eq!(t.count(Signal::Accepted), 1);
	let accepted = t.position(0, Signal::Accepted).unwrap();
	let closing = t.position(0, Signal::Closing).unwrap();
	assert!(accepted < closing);
	drop(t);
	assert_eq!(pool.used_slots(), 0);

	// the rejected client sees the connection closed
	client
		.set_read_timeout(Some(Duration::from_secs(5)))
		.expect("timeout");
	let mut buf = [0u8; 1];
	assert_eq!(client.read(&mut buf).expect("read eof"), 0);
}

#[test]
fn orderly_shutdown_delivers_tail_then_reaps() {
	let (handler, trace) = recorder(false, false, false);
	let cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);
	// silence the end-of-cycle reminders so only the half-close path emits
	// DataLeft
	pool
		.notifier_mut()
		.expect("notifier")
		.emit_old_data_signal = false;

	let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
	client.write_all(b"BYE").expect("write");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.payloads.iter().any(|p| p == b"BYE")
	}));

	client.shutdown(Shutdown::Write).expect("half close");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::Closing) == 1
	}));

	let t = trace.borrow();
	let data_in = t.position(0, Signal::DataIn).unwrap();
	let data_left = t.position(0, Signal::DataLeft).unwrap();
	let closing = t.position(0, Signal::Closing).unwrap();
	assert!(data_in < data_left, "payload before half-close notice");
	assert!(data_left < closing, "drain chance before teardown");
	drop(t);
	assert_eq!(pool.used_slots(), 0);
}

#[test]
fn accept_beyond_capacity_reports_full() {
	let (handler, trace) = recorder(false, true, false);
	let cfg = config(Transport::Tcp, 1, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let _c1 = TcpStream::connect(("127.0.0.1", port)).expect("connect 1");
	let _c2 = TcpStream::connect(("127.0.0.1", port)).expect("connect 2");

	let mut saw_full = false;
	for _ in 0..400 {
		match pool.poll() {
			Ok(()) => {},
			Err(Error::ConnListFull) => {
				saw_full = true;
				break;
			},
			Err(e) => panic!("unexpected poll failure: {e}"),
		}
		thread::sleep(Duration::from_millis(5));
	}
	assert!(saw_full);
	assert_eq!(trace.borrow().count(Signal::Accepted), 1);
	assert_eq!(pool.used_slots(), 1);
	assert!(pool.stats().queue_full_count >= 1);
}

#[test]
fn unread_bytes_are_resignalled() {
	let (handler, trace) = recorder(false, false, false);
	let cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
	client.write_all(b"data").expect("write");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::DataIn) == 1
	}));

	// the embedder did not advance bufpos, so every further cycle reminds it
	pool.poll().expect("poll");
	pool.poll().expect("poll");
	assert!(trace.borrow().count(Signal::DataLeft) >= 2);
}

#[test]
fn compaction_preserves_unread_bytes() -> anyhow::Result<()> {
	let peer = UdpSocket::bind("127.0.0.1:0")?;
	let peer_port = peer.local_addr()?.port();

	let (handler, _trace) = recorder(false, false, false);
	let mut pool = Pool::new(&config(Transport::Udp, 2, Duration::ZERO, 30), handler)?;
	let idx = pool.connect_v4(ConnFlags::empty(), 0x7f00_0001, peer_port, Duration::ZERO)?;
	let local = pool.conn(idx).unwrap().local().expect("local endpoint");

	peer.send_to(&[b'a'; 25], local.addr())?;
	thread::sleep(Duration::from_millis(50));
	assert_eq!(pool.recv(idx)?, RecvStatus::Data(25));
	pool.conn_mut(idx).unwrap().advance(22);

	peer.send_to(b"zzzzz", local.addr())?;
	thread::sleep(Duration::from_millis(50));
	// bufpos 22 is past 30 - 30/3 = 20: the 3 unread bytes shift to the
	// front before the read lands behind them
	assert_eq!(pool.recv(idx)?, RecvStatus::Data(5));
	let conn = pool.conn(idx).unwrap();
	assert_eq!(conn.bufpos(), 0);
	assert_eq!(conn.buffill(), 8);
	assert_eq!(conn.data(), b"aaazzzzz");

	// nothing pending: repeated receives change no buffer fields
	assert_eq!(pool.recv(idx)?, RecvStatus::NoData);
	assert_eq!(pool.recv(idx)?, RecvStatus::NoData);
	let conn = pool.conn(idx).unwrap();
	assert_eq!((conn.bufpos(), conn.buffill()), (0, 8));
	Ok(())
}

#[test]
fn moved_connection_keeps_its_descriptor() {
	let peer = UdpSocket::bind("127.0.0.1:0").expect("peer bind");
	let peer_port = peer.local_addr().expect("peer addr").port();

	let (handler_a, trace_a) = recorder(false, true, false);
	let (handler_b, trace_b) = recorder(false, true, false);
	let mut a = Pool::new(&config(Transport::Udp, 2, Duration::ZERO, 64), handler_a).expect("a");
	let mut b = Pool::new(&config(Transport::Udp, 2, Duration::ZERO, 64), handler_b).expect("b");

	let idx = a
		.connect_v4(ConnFlags::empty(), 0x7f00_0001, peer_port, Duration::ZERO)
		.expect("connect");
	let fd = a.conn(idx).unwrap().fd();
	let local = a.conn(idx).unwrap().local().expect("local");

	let dst = b.move_conn_from(&mut a, idx).expect("move");
	assert_eq!(a.used_slots(), 0);
	assert_eq!(b.used_slots(), 1);
	assert_eq!(b.conn(dst).unwrap().fd(), fd);
	assert!(trace_a.borrow().position(idx, Signal::MovedFrom).is_some());
	assert!(trace_b.borrow().position(dst, Signal::MovedTo).is_some());

	// the moved descriptor still receives from the peer
	peer.send_to(b"after-move", local.addr()).expect("send");
	thread::sleep(Duration::from_millis(50));
	assert_eq!(b.recv(dst).expect("recv"), RecvStatus::Data(10));
	assert_eq!(b.conn(dst).unwrap().data(), b"after-move");
}

#[test]
fn udp_accept_denial_leaves_no_slot() {
	let (handler, trace) = recorder(false, true, true);
	let cfg = config(Transport::Udp, 4, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let client = UdpSocket::bind("127.0.0.1:0").expect("client bind");
	client.send_to(b"X", ("127.0.0.1", port)).expect("send");

	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::Closing) >= 1
	}));
	// the peer was rejected before any data delivery
	assert_eq!(pool.used_slots(), 0);
	assert_eq!(trace.borrow().count(Signal::DataIn), 0);
}

#[test]
fn pool_send_reaches_udp_peer() {
	let peer = UdpSocket::bind("127.0.0.1:0").expect("peer bind");
	peer
		.set_read_timeout(Some(Duration::from_secs(5)))
		.expect("timeout");
	let peer_port = peer.local_addr().expect("peer addr").port();

	let (handler, _trace) = recorder(false, true, false);
	let mut pool =
		Pool::new(&config(Transport::Udp, 2, Duration::ZERO, 64), handler).expect("pool");
	let idx = pool
		.connect_v4(ConnFlags::empty(), 0x7f00_0001, peer_port, Duration::ZERO)
		.expect("connect");

	assert_eq!(pool.send(idx, b"knock").expect("send"), 5);
	let mut buf = [0u8; 16];
	let (n, _) = peer.recv_from(&mut buf).expect("peer recv");
	assert_eq!(&buf[..n], b"knock");

	// finders resolve the new connection
	let fd = pool.conn(idx).unwrap().fd().unwrap();
	assert_eq!(pool.get_conn_by_fd(fd), Some(idx));
	assert_eq!(pool.get_conn_by_port(peer_port, false), Some(idx));
	let remote = pool.conn(idx).unwrap().remote().unwrap();
	assert_eq!(pool.get_conn_by_address(&remote.addr(), false), Some(idx));
}

#[test]
fn async_pool_signals_can_send() {
	let server = std::net::TcpListener::bind("127.0.0.1:0").expect("server");
	let port = server.local_addr().expect("addr").port();

	let (handler, trace) = recorder(false, true, false);
	let mut cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	cfg.async_io = true;
	let mut pool = Pool::new(&cfg, handler).expect("pool");
	let idx = pool
		.connect_v4(ConnFlags::empty(), 0x7f00_0001, port, Duration::ZERO)
		.expect("connect");
	let _peer = server.accept().expect("accept");

	// an idle outbound socket is permanently writable, so every cycle
	// offers backpressure relief
	assert!(pump_until(&mut pool, &trace, |t| {
		t.events.contains(&(idx, Signal::CanSend))
	}));
}

#[test]
fn is_alive_probes_and_expires() {
	let peer = UdpSocket::bind("127.0.0.1:0").expect("peer bind");
	let peer_port = peer.local_addr().expect("peer addr").port();

	let (handler, trace) = recorder(false, true, false);
	let mut pool =
		Pool::new(&config(Transport::Udp, 2, Duration::ZERO, 64), handler).expect("pool");
	let idx = pool
		.connect_v4(ConnFlags::empty(), 0x7f00_0001, peer_port, Duration::ZERO)
		.expect("connect");

	let state = pool.connection_is_alive(idx);
	assert!(state.contains(ConnState::CONNECTED));
	assert!(state.contains(ConnState::OUT), "idle socket is writable");

	// free slots probe as empty
	assert_eq!(pool.connection_is_alive(1), ConnState::empty());

	// an overdue deadline closes the connection on the spot
	pool
		.conn_mut(idx)
		.unwrap()
		.set_expire(connpool::clock::Deadline::after(Duration::ZERO));
	thread::sleep(Duration::from_millis(5));
	assert_eq!(pool.connection_is_alive(idx), ConnState::empty());
	assert_eq!(pool.used_slots(), 0);
	assert_eq!(pool.stats().timedout, 1);
	assert!(trace.borrow().position(idx, Signal::Closing).is_some());
}

#[test]
fn check_conns_reaps_reset_peers() {
	let (handler, trace) = recorder(false, true, false);
	let cfg = config(Transport::Tcp, 2, Duration::ZERO, 64);
	let (mut pool, port) = listening_pool(&cfg, handler);

	let client = socket2::Socket::new(
		socket2::Domain::IPV4,
		socket2::Type::STREAM,
		None,
	)
	.expect("client socket");
	let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
	client.connect(&addr.into()).expect("connect");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.count(Signal::Accepted) == 1
	}));
	assert_eq!(pool.used_slots(), 1);

	// a healthy connection survives the error sweep
	pool.check_conns().expect("check");
	assert_eq!(pool.used_slots(), 1);

	// an abortive close (linger 0) raises error/hangup on the server side
	client
		.set_linger(Some(Duration::ZERO))
		.expect("linger");
	drop(client);
	thread::sleep(Duration::from_millis(50));
	pool.check_conns().expect("check");
	assert_eq!(pool.used_slots(), 0);
	assert!(trace.borrow().position(0, Signal::Closing).is_some());
}

#[test]
fn outbound_tcp_connect_signals_connected() {
	let server = std::net::TcpListener::bind("127.0.0.1:0").expect("server");
	let port = server.local_addr().expect("addr").port();

	let (handler, trace) = recorder(false, true, false);
	let mut pool =
		Pool::new(&config(Transport::Tcp, 2, Duration::ZERO, 64), handler).expect("pool");
	let idx = pool
		.connect_v4(ConnFlags::empty(), 0x7f00_0001, port, Duration::ZERO)
		.expect("connect");

	assert!(trace.borrow().position(idx, Signal::Connected).is_some());
	assert_eq!(pool.used_slots(), 1);
	let (mut peer, _) = server.accept().expect("accept");

	// data flows through the pool's event loop once a notifier exists
	peer.write_all(b"welcome").expect("write");
	assert!(pump_until(&mut pool, &trace, |t| {
		t.payloads.iter().any(|p| p == b"welcome")
	}));
	pool.close_connection(idx);
	assert_eq!(pool.used_slots(), 0);
	assert_eq!(trace.borrow().count(Signal::Closing), 1);
}
