//! Exercises of the QRTR transport through a fake datagram endpoint.
//!
//! The endpoint reads test-injected datagrams, each prefixed with the
//! pretended source address, from a SOCK_DGRAM socket pair, and records
//! outbound packets for inspection.

mod common;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use qmi::transport::qrtr::QRTR_PORT_CTRL;
use qmi::{Device, Endpoint, MainLoop, QrtrAddress, Service};

use common::{pump, pump_until};

type SentLog = Rc<RefCell<Vec<(u32, u32, Vec<u8>)>>>;

struct FakeEndpoint {
	rx: RawFd,
	node: u32,
	sent: SentLog,
}

impl Drop for FakeEndpoint {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.rx);
		}
	}
}

impl Endpoint for FakeEndpoint {
	fn raw_fd(&self) -> RawFd {
		self.rx
	}

	fn local_node(&self) -> io::Result<u32> {
		Ok(self.node)
	}

	fn send_to(&self, node: u32, port: u32, buf: &[u8]) -> io::Result<usize> {
		self.sent.borrow_mut().push((node, port, buf.to_vec()));
		Ok(buf.len())
	}

	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, QrtrAddress)> {
		let mut datagram = [0u8; 2056];
		let n = unsafe { libc::recv(self.rx, datagram.as_mut_ptr().cast(), datagram.len(), 0) };
		if n < 0 {
			return Err(io::Error::last_os_error());
		}

		let n = n as usize;
		assert!(n >= 8, "test datagram carries an address prefix");

		let node = u32::from_le_bytes(datagram[0..4].try_into().unwrap());
		let port = u32::from_le_bytes(datagram[4..8].try_into().unwrap());
		let payload = &datagram[8..n];

		buf[..payload.len()].copy_from_slice(payload);
		Ok((payload.len(), QrtrAddress { node, port }))
	}
}

struct Harness {
	ml: Rc<MainLoop>,
	device: Device,
	inject_fd: RawFd,
	sent: SentLog,
}

impl Harness {
	/// Delivers a datagram to the device as if it came from `(node, port)`.
	fn inject(&self, node: u32, port: u32, payload: &[u8]) {
		let mut datagram = node.to_le_bytes().to_vec();
		datagram.extend_from_slice(&port.to_le_bytes());
		datagram.extend_from_slice(payload);

		let n = unsafe {
			libc::send(
				self.inject_fd,
				datagram.as_ptr().cast(),
				datagram.len(),
				0,
			)
		};
		assert_eq!(n, datagram.len() as isize);
	}
}

impl Drop for Harness {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.inject_fd);
		}
	}
}

fn harness(node: u32) -> Harness {
	let mut fds = [0; 2];
	let rc = unsafe {
		libc::socketpair(
			libc::AF_UNIX,
			libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
			0,
			fds.as_mut_ptr(),
		)
	};
	assert_eq!(rc, 0, "socketpair failed");

	let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
	let endpoint = FakeEndpoint {
		rx: fds[0],
		node,
		sent: sent.clone(),
	};

	let ml = Rc::new(MainLoop::new());
	let device = Device::new_qrtr_with_endpoint(node, Box::new(endpoint), ml.clone());

	Harness {
		ml,
		device,
		inject_fd: fds[1],
		sent,
	}
}

/// `struct qrtr_ctrl_pkt` bytes.
fn ctrl_pkt(cmd: u32, service: u32, instance: u32, node: u32, port: u32) -> Vec<u8> {
	let mut pkt = Vec::with_capacity(20);
	pkt.extend_from_slice(&cmd.to_le_bytes());
	pkt.extend_from_slice(&service.to_le_bytes());
	pkt.extend_from_slice(&instance.to_le_bytes());
	pkt.extend_from_slice(&node.to_le_bytes());
	pkt.extend_from_slice(&port.to_le_bytes());
	pkt
}

const NEW_SERVER: u32 = 4;
const DEL_SERVER: u32 = 5;
const NEW_LOOKUP: u32 = 10;

fn announce_wds(h: &Harness) {
	// WDS (type 1) version 1.0 at port 100 on our node.
	h.inject(0, QRTR_PORT_CTRL, &ctrl_pkt(NEW_SERVER, 1, 1, 1, 100));
	pump_until(&h.ml, || h.device.has_service(1));
}

fn create_wds(h: &Harness) -> Service {
	let slot: Rc<RefCell<Option<Service>>> = Rc::new(RefCell::new(None));
	let slot2 = slot.clone();
	h.device
		.create_service(1, move |service| {
			*slot2.borrow_mut() = Some(service.expect("local allocation"));
		})
		.unwrap();

	pump_until(&h.ml, || slot.borrow().is_some());
	let service = slot.borrow_mut().take().unwrap();
	assert_eq!(service.identifier(), Some("WDS"));
	service
}

#[test]
fn discover_sends_a_lookup() {
	let h = harness(1);

	h.device.discover(|| {}).unwrap();

	let sent = h.sent.borrow();
	assert_eq!(sent.len(), 1);
	let (node, port, payload) = &sent[0];
	assert_eq!(*node, 1, "control packets go to the local node");
	assert_eq!(*port, QRTR_PORT_CTRL);
	assert_eq!(payload, &ctrl_pkt(NEW_LOOKUP, 0, 0, 0, 0));
}

#[test]
fn new_server_populates_the_version_table() {
	let h = harness(1);

	announce_wds(&h);
	assert_eq!(h.device.service_version(1), Some((1, 0)));

	// Announcements for foreign nodes are ignored.
	h.inject(0, QRTR_PORT_CTRL, &ctrl_pkt(NEW_SERVER, 2, 1, 9, 200));
	pump(&h.ml, 5);
	assert!(!h.device.has_service(2));

	// A re-announcement updates the entry in place.
	h.inject(0, QRTR_PORT_CTRL, &ctrl_pkt(NEW_SERVER, 1, (2 << 8) | 3, 1, 100));
	pump_until(&h.ml, || h.device.service_version(1) == Some((3, 2)));
}

#[test]
fn del_server_removes_the_entry() {
	let h = harness(1);
	announce_wds(&h);

	// Wrong port: nothing happens.
	h.inject(0, QRTR_PORT_CTRL, &ctrl_pkt(DEL_SERVER, 1, 1, 1, 101));
	pump(&h.ml, 5);
	assert!(h.device.has_service(1));

	h.inject(0, QRTR_PORT_CTRL, &ctrl_pkt(DEL_SERVER, 1, 1, 1, 100));
	pump_until(&h.ml, || !h.device.has_service(1));
}

#[test]
fn discover_completes_synchronously_once_populated() {
	let h = harness(1);
	announce_wds(&h);

	let done = Rc::new(Cell::new(false));
	let flag = done.clone();
	h.device.discover(move || flag.set(true)).unwrap();

	pump_until(&h.ml, || done.get());

	// No lookup needed the second time around.
	assert!(h.sent.borrow().is_empty());
}

#[test]
fn create_fails_before_any_announcement() {
	let h = harness(1);
	assert!(h.device.create_service(1, |_| {}).is_err());
}

#[test]
fn create_fails_for_unannounced_types() {
	let h = harness(1);
	announce_wds(&h);
	assert!(h.device.create_service(2, |_| {}).is_err());
}

#[test]
fn requests_are_routed_to_the_announced_port() {
	let h = harness(1);
	announce_wds(&h);
	let service = create_wds(&h);

	let answered = Rc::new(Cell::new(false));
	let flag = answered.clone();
	let tid = service
		.send(0x0020, None, move |result| {
			assert_eq!(result.error(), None);
			flag.set(true);
		})
		.unwrap();
	assert_eq!(tid, 256);

	{
		let sent = h.sent.borrow();
		assert_eq!(sent.len(), 1);
		let (node, port, payload) = &sent[0];
		assert_eq!((*node, *port), (1, 100));

		// The mux header stays local: service header + message header.
		assert_eq!(
			payload,
			&[0x00, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00],
			"on-wire service request"
		);
	}

	// Answer from the announced port; the response is re-wrapped and
	// matched by transaction id.
	let mut response = vec![0x02, 0x00, 0x01, 0x20, 0x00, 0x07, 0x00];
	response.extend_from_slice(&[0x02, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);
	h.inject(1, 100, &response);

	pump_until(&h.ml, || answered.get());
}

#[test]
fn indications_follow_the_port_mapping() {
	let h = harness(1);
	announce_wds(&h);
	let service = create_wds(&h);

	let hits = Rc::new(Cell::new(0u32));
	let counter = hits.clone();
	service.register(0x0022, move |_result| counter.set(counter.get() + 1));

	// kind 0x04, tid 0, message 0x0022, no TLVs
	let indication = [0x04, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00];

	h.inject(1, 100, &indication);
	pump_until(&h.ml, || hits.get() == 1);

	// Datagrams from unannounced ports are dropped.
	h.inject(1, 101, &indication);
	pump(&h.ml, 5);
	assert_eq!(hits.get(), 1);
}

#[test]
fn release_is_local_and_shutdown_is_immediate() {
	let h = harness(1);
	announce_wds(&h);
	let service = create_wds(&h);

	let before = h.sent.borrow().len();
	drop(service);
	pump(&h.ml, 5);
	assert_eq!(h.sent.borrow().len(), before, "no release traffic on QRTR");

	let down = Rc::new(Cell::new(false));
	let flag = down.clone();
	h.device.shutdown(move || flag.set(true)).unwrap();
	pump_until(&h.ml, || down.get());
}

#[test]
fn sync_is_rejected() {
	let h = harness(1);
	assert!(h.device.sync(|| {}).is_err());
	assert!(!h.device.is_sync_supported());
}
