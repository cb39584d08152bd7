//! Request bookkeeping and the two transport variants.
//!
//! A submitted request moves through at most two queues: the pending-write
//! queue (mux only; QRTR transmits immediately) and one of the two
//! awaiting-reply queues, split by transport class because control
//! transactions use 8-bit identifiers and service transactions 16-bit
//! ones. The transport variant is fixed at device construction.

pub(crate) mod mux;
pub mod qrtr;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use enum_dispatch::enum_dispatch;

use crate::debug::DebugSink;
use crate::device::Inner;
use crate::executor::Scheduler;
use crate::service::ServiceInner;
use crate::services::SERVICE_CONTROL;
use crate::tlv::Param;
use crate::wire;

use self::mux::MuxTransport;
use self::qrtr::QrtrTransport;

/// Completion callback of a request: message identifier and the raw TLV
/// area of the response.
pub(crate) type RequestFn = Box<dyn FnOnce(u16, &[u8])>;

/// Borrowed device state a transport needs while transmitting.
pub(crate) struct TxContext<'a> {
	pub sched: &'a Rc<dyn Scheduler>,
	pub device: &'a Weak<RefCell<Inner>>,
	pub queues: &'a mut RequestQueues,
	pub services: &'a HashMap<u16, Weak<ServiceInner>>,
	pub debug: &'a mut Option<DebugSink>,
}

#[enum_dispatch]
pub(crate) trait Transport {
	/// Arms the receive path. Called once, right after the device is set
	/// up behind its `Rc`.
	fn attach(&mut self, device: &Weak<RefCell<Inner>>, sched: &Rc<dyn Scheduler>);

	/// Hands over a request whose transaction identifier has already been
	/// assigned.
	fn submit(&mut self, ctx: TxContext<'_>, req: Request);

	/// Whether client identifiers must be handed back through the control
	/// service when a service is dropped.
	fn needs_release(&self) -> bool;

	/// Disarms watches. Descriptor ownership is handled by the transport's
	/// own drop.
	fn detach(&mut self, sched: &Rc<dyn Scheduler>);
}

#[enum_dispatch(Transport)]
pub(crate) enum ModemTransport {
	Mux(MuxTransport),
	Qrtr(QrtrTransport),
}

/// One in-flight request.
pub(crate) struct Request {
	/// Assigned at submission; 0 beforehand.
	pub tid: u16,
	pub service: u8,
	pub client: u8,
	/// The encoded frame. The mux write path drops it once the bytes are
	/// out; the QRTR path keeps it so responses can be re-wrapped against
	/// it uniformly.
	pub buf: Option<Vec<u8>>,
	pub callback: Option<RequestFn>,
}

impl Request {
	pub fn new(
		service: u8,
		client: u8,
		message: u16,
		param: Option<&Param>,
		callback: RequestFn,
	) -> Self {
		let tlvs = param.map_or(&[][..], Param::data);

		Self {
			tid: 0,
			service,
			client,
			buf: Some(wire::build_request(service, client, message, tlvs)),
			callback: Some(callback),
		}
	}
}

/// The three per-device request queues and both transaction-id counters.
pub(crate) struct RequestQueues {
	pending: VecDeque<Request>,
	control: Vec<Request>,
	service: Vec<Request>,
	next_control_tid: u8,
	next_service_tid: u16,
}

impl RequestQueues {
	pub fn new() -> Self {
		Self {
			pending: VecDeque::new(),
			control: Vec::new(),
			service: Vec::new(),
			next_control_tid: 1,
			next_service_tid: 256,
		}
	}

	/// Assigns the next transaction identifier of the request's class and
	/// stamps it into the encoded frame.
	///
	/// Control identifiers are 8-bit and skip 0 on wrap. Service
	/// identifiers are 16-bit and restart at 256, leaving the low byte
	/// range to control transactions in diagnostic output.
	pub fn assign_tid(&mut self, req: &mut Request) -> u16 {
		let tid = if req.service == SERVICE_CONTROL {
			let tid = self.next_control_tid;
			self.next_control_tid = self.next_control_tid.wrapping_add(1);
			if self.next_control_tid == 0 {
				self.next_control_tid = 1;
			}
			u16::from(tid)
		} else {
			let tid = self.next_service_tid;
			self.next_service_tid = self.next_service_tid.wrapping_add(1);
			if self.next_service_tid < 256 {
				self.next_service_tid = 256;
			}
			tid
		};

		req.tid = tid;
		if let Some(buf) = req.buf.as_mut() {
			wire::set_transaction(buf, tid);
		}

		tid
	}

	pub fn push_pending(&mut self, req: Request) {
		self.pending.push_back(req);
	}

	pub fn pop_pending(&mut self) -> Option<Request> {
		self.pending.pop_front()
	}

	pub fn pending_is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Files a transmitted request under the awaiting-reply queue of its
	/// transport class.
	pub fn push_awaiting(&mut self, req: Request) {
		if req.service == SERVICE_CONTROL {
			self.control.push(req);
		} else {
			self.service.push(req);
		}
	}

	pub fn take_control(&mut self, tid: u8) -> Option<Request> {
		let pos = self.control.iter().position(|req| req.tid == u16::from(tid))?;
		Some(self.control.remove(pos))
	}

	pub fn take_service(&mut self, tid: u16) -> Option<Request> {
		let pos = self.service.iter().position(|req| req.tid == tid)?;
		Some(self.service.remove(pos))
	}

	pub fn take_pending(&mut self, tid: u16) -> Option<Request> {
		let pos = self.pending.iter().position(|req| req.tid == tid)?;
		self.pending.remove(pos)
	}

	/// Drops every queued request belonging to a client, pending or
	/// awaiting. Dropping runs the captured destructors.
	pub fn purge_client(&mut self, client: u8) {
		self.pending.retain(|req| req.client != client);
		self.service.retain(|req| req.client != client);
	}

	pub fn clear(&mut self) {
		self.pending.clear();
		self.control.clear();
		self.service.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(service: u8, client: u8) -> Request {
		Request::new(service, client, 0x0001, None, Box::new(|_, _| {}))
	}

	#[test]
	fn control_tid_skips_zero_on_wrap() {
		let mut queues = RequestQueues::new();
		queues.next_control_tid = 0xff;

		let mut req = request(SERVICE_CONTROL, 0);
		assert_eq!(queues.assign_tid(&mut req), 0xff);

		let mut req = request(SERVICE_CONTROL, 0);
		assert_eq!(queues.assign_tid(&mut req), 1);
	}

	#[test]
	fn service_tid_wraps_to_256() {
		let mut queues = RequestQueues::new();

		let mut req = request(0x02, 7);
		assert_eq!(queues.assign_tid(&mut req), 256);

		queues.next_service_tid = u16::MAX;
		let mut req = request(0x02, 7);
		assert_eq!(queues.assign_tid(&mut req), u16::MAX);

		let mut req = request(0x02, 7);
		assert_eq!(queues.assign_tid(&mut req), 256);
	}

	#[test]
	fn assigned_tid_is_stamped_into_the_frame() {
		let mut queues = RequestQueues::new();

		let mut req = request(0x02, 7);
		queues.assign_tid(&mut req);

		let buf = req.buf.as_ref().unwrap();
		assert_eq!(wire::get_u16(buf, 7), 256);
	}

	#[test]
	fn awaiting_queues_are_split_by_class() {
		let mut queues = RequestQueues::new();

		let mut ctl = request(SERVICE_CONTROL, 0);
		queues.assign_tid(&mut ctl);
		let ctl_tid = ctl.tid;
		queues.push_awaiting(ctl);

		let mut svc = request(0x02, 7);
		queues.assign_tid(&mut svc);
		let svc_tid = svc.tid;
		queues.push_awaiting(svc);

		assert!(queues.take_service(ctl_tid).is_none());
		assert!(queues.take_control(ctl_tid as u8).is_some());
		assert!(queues.take_service(svc_tid).is_some());
		assert!(queues.take_service(svc_tid).is_none());
	}

	#[test]
	fn purge_client_empties_both_queues() {
		let mut queues = RequestQueues::new();

		let mut req = request(0x02, 7);
		queues.assign_tid(&mut req);
		queues.push_pending(req);

		let mut req = request(0x02, 7);
		queues.assign_tid(&mut req);
		queues.push_awaiting(req);

		let mut req = request(0x02, 9);
		queues.assign_tid(&mut req);
		let keep = req.tid;
		queues.push_awaiting(req);

		queues.purge_client(7);

		assert!(queues.pending_is_empty());
		assert!(queues.take_service(keep).is_some());
	}
}
