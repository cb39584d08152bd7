//! The QRTR datagram transport.
//!
//! QRTR replaces the mux framing with AF_QIPCRTR datagrams: services live
//! at `(node, port)` addresses announced by the router, and the mux header
//! only exists locally so both transports can share one demultiplexer.
//! The raw socket sits behind [`Endpoint`] so tests and alternative
//! backends can substitute their own datagram carrier.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{Request, Transport, TxContext};
use crate::debug::{debug_line, hexdump, trace_message};
use crate::device::{self, Inner};
use crate::executor::{IoCondition, Scheduler, WatchId};
use crate::wire::MUX_HDR_SIZE;

/// `AF_QIPCRTR` address family, per `linux/qrtr.h`. Not exposed by the
/// `libc` crate, so it is defined here to match the kernel header.
const AF_QIPCRTR: libc::c_int = 42;

/// `struct sockaddr_qrtr`, per `linux/qrtr.h`. Not exposed by the `libc`
/// crate, so it is defined here to match the kernel header's layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct sockaddr_qrtr {
	sq_family: libc::sa_family_t,
	sq_node: u32,
	sq_port: u32,
}

/// Port of the router's control service.
pub const QRTR_PORT_CTRL: u32 = 0xffff_fffe;

/// Size of `struct qrtr_ctrl_pkt` on the wire.
pub(crate) const CTRL_PKT_SIZE: usize = 20;

/// Control-packet commands of the QRTR router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub(crate) enum QrtrCommand {
	Data = 1,
	Hello = 2,
	Bye = 3,
	NewServer = 4,
	DelServer = 5,
	DelClient = 6,
	ResumeTx = 7,
	Exit = 8,
	Ping = 9,
	NewLookup = 10,
	DelLookup = 11,
}

/// Source or destination of a QRTR datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrtrAddress {
	pub node: u32,
	pub port: u32,
}

/// A datagram carrier for the QRTR transport.
///
/// [`QrtrSocket`] is the AF_QIPCRTR implementation; tests provide their
/// own to feed datagrams in without a router on the machine.
pub trait Endpoint {
	/// The descriptor the receive watch polls.
	fn raw_fd(&self) -> RawFd;

	/// The node identifier the socket is bound to.
	fn local_node(&self) -> io::Result<u32>;

	fn send_to(&self, node: u32, port: u32, buf: &[u8]) -> io::Result<usize>;

	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, QrtrAddress)>;
}

/// An AF_QIPCRTR datagram socket.
pub struct QrtrSocket {
	fd: OwnedFd,
}

impl QrtrSocket {
	pub fn new() -> io::Result<Self> {
		let fd = unsafe {
			libc::socket(
				AF_QIPCRTR,
				libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
				0,
			)
		};
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(Self {
			fd: unsafe { OwnedFd::from_raw_fd(fd) },
		})
	}
}

impl Endpoint for QrtrSocket {
	fn raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}

	fn local_node(&self) -> io::Result<u32> {
		let mut addr: sockaddr_qrtr = unsafe { mem::zeroed() };
		let mut len = mem::size_of::<sockaddr_qrtr>() as libc::socklen_t;

		let rc = unsafe {
			libc::getsockname(self.fd.as_raw_fd(), (&raw mut addr).cast(), &mut len)
		};
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(addr.sq_node)
	}

	fn send_to(&self, node: u32, port: u32, buf: &[u8]) -> io::Result<usize> {
		let addr = sockaddr_qrtr {
			sq_family: AF_QIPCRTR as libc::sa_family_t,
			sq_node: node,
			sq_port: port,
		};

		let n = unsafe {
			libc::sendto(
				self.fd.as_raw_fd(),
				buf.as_ptr().cast(),
				buf.len(),
				0,
				(&raw const addr).cast(),
				mem::size_of::<sockaddr_qrtr>() as libc::socklen_t,
			)
		};
		if n < 0 {
			Err(io::Error::last_os_error())
		} else {
			Ok(n as usize)
		}
	}

	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, QrtrAddress)> {
		let mut addr: sockaddr_qrtr = unsafe { mem::zeroed() };
		let mut len = mem::size_of::<sockaddr_qrtr>() as libc::socklen_t;

		let n = unsafe {
			libc::recvfrom(
				self.fd.as_raw_fd(),
				buf.as_mut_ptr().cast(),
				buf.len(),
				0,
				(&raw mut addr).cast(),
				&mut len,
			)
		};
		if n < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok((
			n as usize,
			QrtrAddress {
				node: addr.sq_node,
				port: addr.sq_port,
			},
		))
	}
}

/// Sends a raw QRTR packet. Control packets are addressed with the local
/// node; everything else goes to the node the caller resolved.
pub(crate) fn send_packet(
	endpoint: &dyn Endpoint,
	node: u32,
	port: u32,
	buf: &[u8],
) -> io::Result<usize> {
	let node = if port == QRTR_PORT_CTRL {
		endpoint.local_node()?
	} else {
		node
	};

	endpoint.send_to(node, port, buf)
}

/// Asks the router to start announcing services with NEW_SERVER events.
pub(crate) fn send_lookup(endpoint: &dyn Endpoint) -> io::Result<()> {
	let mut pkt = [0u8; CTRL_PKT_SIZE];
	pkt[..4].copy_from_slice(&u32::from(QrtrCommand::NewLookup).to_le_bytes());

	send_packet(endpoint, 0, QRTR_PORT_CTRL, &pkt).map(|_| ())
}

pub(crate) struct QrtrTransport {
	pub(crate) endpoint: Box<dyn Endpoint>,
	pub(crate) node_id: u32,
	read_watch: Option<WatchId>,
}

impl QrtrTransport {
	pub fn new(node_id: u32, endpoint: Box<dyn Endpoint>) -> Self {
		Self {
			endpoint,
			node_id,
			read_watch: None,
		}
	}
}

impl Transport for QrtrTransport {
	fn attach(&mut self, device: &Weak<RefCell<Inner>>, sched: &Rc<dyn Scheduler>) {
		let weak = device.clone();
		self.read_watch = Some(sched.watch(
			self.endpoint.raw_fd(),
			IoCondition::IN | IoCondition::HUP | IoCondition::ERR,
			Box::new(move |cond| device::qrtr_readable(&weak, cond)),
		));
	}

	fn submit(&mut self, ctx: TxContext<'_>, req: Request) {
		// Service requests only; client ids are managed locally and the
		// router has no control service to talk to.
		let port = ctx
			.services
			.values()
			.filter_map(Weak::upgrade)
			.find(|svc| svc.type_ == req.service)
			.map(|svc| u32::from(svc.port));

		let Some(port) = port else {
			debug_line(
				ctx.debug,
				format_args!("no destination for service {}", req.service),
			);
			return;
		};

		let buf = req.buf.as_ref().expect("submitted request has a frame");

		if send_packet(
			self.endpoint.as_ref(),
			self.node_id,
			port,
			&buf[MUX_HDR_SIZE..],
		)
		.is_err()
		{
			debug_line(ctx.debug, format_args!("failed to send request"));
		}

		hexdump('>', buf, ctx.debug);
		trace_message(' ', buf, ctx.debug);

		ctx.queues.push_awaiting(req);
	}

	fn needs_release(&self) -> bool {
		false
	}

	fn detach(&mut self, sched: &Rc<dyn Scheduler>) {
		if let Some(id) = self.read_watch.take() {
			sched.unwatch(id);
		}
	}
}
