#![allow(dead_code)]

use std::os::fd::RawFd;
use std::time::Duration;

use qmi::MainLoop;

/// A connected non-blocking stream pair standing in for the `cdc-wdm`
/// character device: one end for the device under test, one for the
/// pretend modem.
pub fn socketpair() -> (RawFd, RawFd) {
	let mut fds = [0; 2];
	let rc = unsafe {
		libc::socketpair(
			libc::AF_UNIX,
			libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
			0,
			fds.as_mut_ptr(),
		)
	};
	assert_eq!(rc, 0, "socketpair failed");
	(fds[0], fds[1])
}

pub fn read_from(fd: RawFd) -> Vec<u8> {
	let mut buf = [0u8; 2048];
	let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
	if n <= 0 { Vec::new() } else { buf[..n as usize].to_vec() }
}

pub fn write_to(fd: RawFd, buf: &[u8]) {
	let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
	assert_eq!(n, buf.len() as isize, "short write into test socket");
}

/// Iterates the loop until the condition holds; panics if it never does.
pub fn pump_until(ml: &MainLoop, mut cond: impl FnMut() -> bool) {
	for _ in 0..200 {
		if cond() {
			return;
		}
		ml.iterate(Some(Duration::from_millis(10)));
	}
	panic!("condition not reached after 200 loop turns");
}

/// Iterates the loop a fixed number of turns, for asserting that
/// something does *not* happen.
pub fn pump(ml: &MainLoop, turns: usize) {
	for _ in 0..turns {
		ml.iterate(Some(Duration::from_millis(5)));
	}
}

/// Pumps until the pretend modem receives a request.
pub fn recv_request(ml: &MainLoop, fd: RawFd) -> Vec<u8> {
	for _ in 0..200 {
		let data = read_from(fd);
		if !data.is_empty() {
			return data;
		}
		ml.iterate(Some(Duration::from_millis(10)));
	}
	panic!("no request arrived at the modem side");
}

fn frame(service: u8, client: u8, payload: &[u8]) -> Vec<u8> {
	let mut buf = vec![0x01];
	buf.extend_from_slice(&((5 + payload.len()) as u16).to_le_bytes());
	buf.push(0x80);
	buf.push(service);
	buf.push(client);
	buf.extend_from_slice(payload);
	buf
}

/// A control-service response frame as the modem would send it.
pub fn control_response(tid: u8, message: u16, tlvs: &[u8]) -> Vec<u8> {
	let mut payload = vec![0x01, tid];
	payload.extend_from_slice(&message.to_le_bytes());
	payload.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
	payload.extend_from_slice(tlvs);
	frame(0x00, 0x00, &payload)
}

pub fn service_response(service: u8, client: u8, tid: u16, message: u16, tlvs: &[u8]) -> Vec<u8> {
	let mut payload = vec![0x02];
	payload.extend_from_slice(&tid.to_le_bytes());
	payload.extend_from_slice(&message.to_le_bytes());
	payload.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
	payload.extend_from_slice(tlvs);
	frame(service, client, &payload)
}

pub fn service_indication(service: u8, client: u8, message: u16, tlvs: &[u8]) -> Vec<u8> {
	let mut payload = vec![0x04];
	payload.extend_from_slice(&0u16.to_le_bytes());
	payload.extend_from_slice(&message.to_le_bytes());
	payload.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
	payload.extend_from_slice(tlvs);
	frame(service, client, &payload)
}

/// A success result-code TLV.
pub fn result_ok() -> Vec<u8> {
	vec![0x02, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
}
