//! End-to-end exercises of the mux transport against a pretend modem on
//! the other end of a socket pair.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use qmi::{Device, MainLoop, Service};

use common::*;

struct Harness {
	ml: Rc<MainLoop>,
	device: Device,
	modem: i32,
}

impl Drop for Harness {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.modem);
		}
	}
}

fn harness() -> Harness {
	let ml = Rc::new(MainLoop::new());
	let (dev_fd, modem_fd) = socketpair();

	let device = Device::new(dev_fd, ml.clone()).unwrap();
	device.set_close_on_drop(true);

	Harness {
		ml,
		device,
		modem: modem_fd,
	}
}

/// TLVs of a GET_VERSION_INFO response announcing DMS 1.3 and CTL 1.5.
fn version_info_tlvs() -> Vec<u8> {
	let mut tlvs = result_ok();
	tlvs.extend_from_slice(&[
		0x01, 0x0b, 0x00, // service list, 11 bytes
		0x02, // two entries
		0x02, 0x01, 0x00, 0x03, 0x00, // DMS 1.3
		0x00, 0x01, 0x00, 0x05, 0x00, // CTL 1.5
	]);
	tlvs
}

/// Runs discovery against the pretend modem and returns once the version
/// table is populated.
fn discover(h: &Harness) {
	let done = Rc::new(Cell::new(false));
	let flag = done.clone();
	h.device.discover(move || flag.set(true)).unwrap();

	let request = recv_request(&h.ml, h.modem);
	assert_eq!(
		request,
		[0x01, 0x0b, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00],
		"GET_VERSION_INFO request bytes"
	);

	write_to(
		h.modem,
		&control_response(0x01, 0x0021, &version_info_tlvs()),
	);
	pump_until(&h.ml, || done.get());
}

/// Allocates a DMS client (type 2, id 7) through the pretend modem.
fn create_dms(h: &Harness) -> Service {
	let slot: Rc<RefCell<Option<Service>>> = Rc::new(RefCell::new(None));
	let slot2 = slot.clone();
	h.device
		.create_service(2, move |service| {
			*slot2.borrow_mut() = Some(service.expect("client id allocated"));
		})
		.unwrap();

	let request = recv_request(&h.ml, h.modem);
	assert_eq!(
		request,
		[
			0x01, 0x0f, 0x00, 0x00, 0x00, 0x00, // mux header
			0x00, 0x02, // control header, tid 2
			0x22, 0x00, 0x04, 0x00, // GET_CLIENT_ID
			0x01, 0x01, 0x00, 0x02, // requested service type
		],
		"GET_CLIENT_ID request bytes"
	);

	let mut tlvs = result_ok();
	tlvs.extend_from_slice(&[0x01, 0x02, 0x00, 0x02, 0x07]); // service 2, client 7
	write_to(h.modem, &control_response(0x02, 0x0022, &tlvs));

	pump_until(&h.ml, || slot.borrow().is_some());
	let service = slot.borrow_mut().take().unwrap();

	assert_eq!(service.identifier(), Some("DMS"));
	assert_eq!(service.version(), (1, 3));

	service
}

#[test]
fn discover_populates_version_table() {
	let h = harness();
	discover(&h);

	assert!(h.device.has_service(2));
	assert_eq!(h.device.service_version(2), Some((1, 3)));

	// The control entry feeds sync support, not the version list.
	assert!(!h.device.has_service(0));
	assert!(h.device.is_sync_supported());
}

#[test]
fn service_create_and_send() {
	let h = harness();
	discover(&h);
	let service = create_dms(&h);

	let answered = Rc::new(Cell::new(false));
	let flag = answered.clone();
	let tid = service
		.send(0x0055, None, move |result| {
			assert_eq!(result.message(), 0x0055);
			assert_eq!(result.error(), None);
			flag.set(true);
		})
		.unwrap();
	assert_eq!(tid, 256);

	let request = recv_request(&h.ml, h.modem);
	assert_eq!(
		request,
		[
			0x01, 0x0c, 0x00, 0x00, 0x02, 0x07, // mux header
			0x00, 0x00, 0x01, // service header, tid 0x0100
			0x55, 0x00, 0x00, 0x00, // message header
		],
		"service request bytes"
	);

	write_to(h.modem, &service_response(2, 7, 256, 0x0055, &result_ok()));
	pump_until(&h.ml, || answered.get());
}

#[test]
fn indication_reaches_exactly_the_addressed_client() {
	let h = harness();
	discover(&h);
	let service = create_dms(&h);

	let hits = Rc::new(Cell::new(0u32));
	let counter = hits.clone();
	service.register(0x0024, move |result| {
		assert_eq!(result.message(), 0x0024);
		counter.set(counter.get() + 1);
	});

	// Addressed to our client: delivered once.
	write_to(h.modem, &service_indication(2, 7, 0x0024, &[]));
	pump_until(&h.ml, || hits.get() == 1);

	// Unknown client id: dropped.
	write_to(h.modem, &service_indication(2, 9, 0x0024, &[]));
	pump(&h.ml, 5);
	assert_eq!(hits.get(), 1);

	// Different message id: no subscription matches.
	write_to(h.modem, &service_indication(2, 7, 0x0025, &[]));
	pump(&h.ml, 5);
	assert_eq!(hits.get(), 1);

	// Broadcast client: delivered to every client of the type.
	write_to(h.modem, &service_indication(2, 0xff, 0x0024, &[]));
	pump_until(&h.ml, || hits.get() == 2);

	// Unregistered: nothing fires any more.
	service.unregister_all();
	write_to(h.modem, &service_indication(2, 7, 0x0024, &[]));
	pump(&h.ml, 5);
	assert_eq!(hits.get(), 2);
}

#[test]
fn cancel_swallows_the_late_reply() {
	let h = harness();
	discover(&h);
	let service = create_dms(&h);

	let answered = Rc::new(Cell::new(false));
	let flag = answered.clone();
	let tid = service
		.send(0x0055, None, move |_result| flag.set(true))
		.unwrap();

	// Let the request reach the wire, then cancel while the reply is
	// still outstanding.
	recv_request(&h.ml, h.modem);
	assert!(service.cancel(tid));
	assert!(!service.cancel(tid));

	write_to(h.modem, &service_response(2, 7, tid, 0x0055, &result_ok()));

	pump(&h.ml, 10);
	assert!(!answered.get());
}

#[test]
fn response_with_unknown_tid_is_dropped() {
	let h = harness();
	discover(&h);
	let service = create_dms(&h);

	let answered = Rc::new(Cell::new(false));
	let flag = answered.clone();
	service
		.send(0x0055, None, move |_result| flag.set(true))
		.unwrap();
	recv_request(&h.ml, h.modem);

	write_to(h.modem, &service_response(2, 7, 0x4242, 0x0055, &result_ok()));
	pump(&h.ml, 10);
	assert!(!answered.get());
}

#[test]
fn shared_creation_reuses_the_client() {
	let h = harness();
	discover(&h);
	let first = create_dms(&h);

	// The second creation must not reach the modem.
	let slot: Rc<RefCell<Option<Service>>> = Rc::new(RefCell::new(None));
	let slot2 = slot.clone();
	h.device
		.create_shared_service(2, move |service| {
			*slot2.borrow_mut() = Some(service.expect("shared handle"));
		})
		.unwrap();

	pump_until(&h.ml, || slot.borrow().is_some());
	assert!(read_from(h.modem).is_empty(), "no wire traffic for sharing");

	let second = slot.borrow_mut().take().unwrap();
	assert_eq!(second.version(), (1, 3));

	// Dropping one holder keeps the client alive.
	drop(first);
	pump(&h.ml, 5);
	assert!(read_from(h.modem).is_empty(), "client still shared");

	// Dropping the last one releases it.
	drop(second);
	let request = recv_request(&h.ml, h.modem);
	assert_eq!(request[8], 0x23, "RELEASE_CLIENT_ID leaves");
	assert_eq!(&request[12..], [0x01, 0x02, 0x00, 0x02, 0x07]);
}

#[test]
fn shutdown_waits_for_the_release_reply() {
	let h = harness();
	discover(&h);
	let service = create_dms(&h);

	drop(service);
	let request = recv_request(&h.ml, h.modem);
	assert_eq!(request[8], 0x23, "RELEASE_CLIENT_ID leaves");
	let release_tid = request[7];

	let down = Rc::new(Cell::new(false));
	let flag = down.clone();
	h.device.shutdown(move || flag.set(true)).unwrap();

	// The release is still outstanding; shutdown must hold off.
	pump(&h.ml, 10);
	assert!(!down.get());

	write_to(h.modem, &control_response(release_tid, 0x0023, &result_ok()));
	pump_until(&h.ml, || down.get());
}

#[test]
fn create_without_discovery_fails_synchronously() {
	let h = harness();

	let called = Rc::new(Cell::new(false));
	let flag = called.clone();
	let result = h.device.create_service(2, move |_| flag.set(true));

	assert!(result.is_err());
	pump(&h.ml, 5);
	assert!(!called.get());
}

#[test]
fn debug_sink_sees_both_directions() {
	let h = harness();

	let lines: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
	let sink = lines.clone();
	h.device
		.set_debug(move |line| sink.borrow_mut().push(line.to_string()));

	discover(&h);

	let lines = lines.borrow();
	assert!(lines.iter().any(|l| l.starts_with('>')), "outbound hexdump");
	assert!(lines.iter().any(|l| l.starts_with('<')), "inbound hexdump");
	assert!(
		lines.iter().any(|l| l.contains("CTL_req msg=33")),
		"decoded request one-liner"
	);
	assert!(
		lines.iter().any(|l| l.contains("CTL_resp msg=33")),
		"decoded response one-liner"
	);
	assert!(
		lines.iter().any(|l| l.contains("found service [DMS 1.3]")),
		"discovery announcement"
	);
}
