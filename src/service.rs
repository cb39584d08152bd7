//! Per-client service handles.
//!
//! A [`Service`] scopes request/response traffic and indication delivery
//! to one client id of one service type. Handles are cheaply cloneable;
//! shared creation hands out clones of the same underlying client. When
//! the last handle drops, outstanding requests are cancelled, all
//! notification subscriptions torn down and, on mux transports, the
//! client id is handed back to the modem through the control service.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::ctl;
use crate::device::{Inner, service_key};
use crate::error::Error;
use crate::services::{SERVICE_CONTROL, service_type_name};
use crate::tlv::{Param, QmiResult};
use crate::transport::{Request, RequestFn, Transport};

pub(crate) struct Notify {
	pub(crate) id: u16,
	pub(crate) message: u16,
	/// Taken through a `RefCell` so a callback may unregister
	/// subscriptions (including itself) while a delivery walk is running.
	pub(crate) callback: RefCell<Box<dyn FnMut(&QmiResult<'_>)>>,
}

pub(crate) struct ServiceInner {
	pub(crate) device: Weak<RefCell<Inner>>,
	pub(crate) type_: u8,
	pub(crate) major: u16,
	pub(crate) minor: u16,
	pub(crate) client_id: u8,
	/// Destination port on QRTR transports; unused on mux.
	pub(crate) port: u16,
	next_notify_id: Cell<u16>,
	notify_list: RefCell<Vec<Rc<Notify>>>,
}

impl ServiceInner {
	pub(crate) fn new(
		device: Weak<RefCell<Inner>>,
		type_: u8,
		major: u16,
		minor: u16,
		client_id: u8,
		port: u16,
	) -> Self {
		Self {
			device,
			type_,
			major,
			minor,
			client_id,
			port,
			next_notify_id: Cell::new(1),
			notify_list: RefCell::new(Vec::new()),
		}
	}
}

/// Invokes every subscription of the service matching the indication's
/// message id, in registration order.
pub(crate) fn deliver_notifications(service: &Rc<ServiceInner>, result: &QmiResult<'_>) {
	let matching: Vec<Rc<Notify>> = service
		.notify_list
		.borrow()
		.iter()
		.filter(|notify| notify.message == result.message())
		.cloned()
		.collect();

	for notify in matching {
		(notify.callback.borrow_mut())(result);
	}
}

/// A handle on one client of one service type.
#[derive(Clone)]
pub struct Service {
	inner: Rc<ServiceInner>,
}

impl Service {
	pub(crate) fn from_inner(inner: Rc<ServiceInner>) -> Self {
		Self { inner }
	}

	/// The service type this client talks to.
	pub fn service_type(&self) -> u8 {
		self.inner.type_
	}

	/// The display name of the service type, for known types.
	pub fn identifier(&self) -> Option<&'static str> {
		service_type_name(self.inner.type_)
	}

	/// The discovered (major, minor) version of the service.
	pub fn version(&self) -> (u16, u16) {
		(self.inner.major, self.inner.minor)
	}

	/// Encodes and submits a request. Returns the transaction identifier,
	/// which doubles as the cancellation handle. The completion callback
	/// fires exactly once, unless the request is cancelled or the device
	/// is torn down first.
	pub fn send(
		&self,
		message: u16,
		param: Option<Param>,
		func: impl FnOnce(QmiResult<'_>) + 'static,
	) -> Result<u16, Error> {
		let svc = &self.inner;

		if svc.client_id == 0 {
			return Err(Error::InvalidService);
		}

		let Some(device) = svc.device.upgrade() else {
			return Err(Error::Detached);
		};

		let callback: RequestFn =
			Box::new(move |message, tlvs| func(QmiResult::response(message, tlvs)));

		let req = Request::new(svc.type_, svc.client_id, message, param.as_ref(), callback);

		Ok(device.borrow_mut().submit(req))
	}

	/// Cancels an outstanding request. Returns false if the response has
	/// already been delivered. Purely local; nothing is sent on the wire,
	/// and a response that still arrives is dropped.
	pub fn cancel(&self, tid: u16) -> bool {
		if tid == 0 || self.inner.client_id == 0 {
			return false;
		}

		let Some(device) = self.inner.device.upgrade() else {
			return false;
		};
		let mut inner = device.borrow_mut();

		let req = inner
			.queues
			.take_pending(tid)
			.or_else(|| inner.queues.take_service(tid));

		req.is_some()
	}

	/// Cancels every outstanding request of this client.
	pub fn cancel_all(&self) {
		if self.inner.client_id == 0 {
			return;
		}

		if let Some(device) = self.inner.device.upgrade() {
			device.borrow_mut().queues.purge_client(self.inner.client_id);
		}
	}

	/// Subscribes to an indication message. Returns the subscription id.
	pub fn register(&self, message: u16, func: impl FnMut(&QmiResult<'_>) + 'static) -> u16 {
		let svc = &self.inner;

		let mut id = svc.next_notify_id.get();
		if id < 1 {
			id = 1;
		}
		svc.next_notify_id.set(id.wrapping_add(1));

		svc.notify_list.borrow_mut().push(Rc::new(Notify {
			id,
			message,
			callback: RefCell::new(Box::new(func)),
		}));

		id
	}

	/// Drops a subscription; its captured state is released.
	pub fn unregister(&self, id: u16) -> bool {
		if id == 0 {
			return false;
		}

		let mut list = self.inner.notify_list.borrow_mut();
		match list.iter().position(|notify| notify.id == id) {
			Some(pos) => {
				list.remove(pos);
				true
			}
			None => false,
		}
	}

	/// Drops every subscription of this service.
	pub fn unregister_all(&self) {
		self.inner.notify_list.borrow_mut().clear();
	}
}

impl Drop for ServiceInner {
	fn drop(&mut self) {
		let Some(device) = self.device.upgrade() else {
			return;
		};
		let mut inner = device.borrow_mut();

		if self.client_id != 0 {
			inner.queues.purge_client(self.client_id);
		}
		self.notify_list.borrow_mut().clear();

		inner.services.remove(&service_key(self.type_, self.client_id));

		if !inner.transport.needs_release() {
			return;
		}

		// The client id goes back to the modem; the device defers
		// shutdown until the reply arrives.
		inner.release_users += 1;

		let weak = inner.self_weak.clone();
		let callback: RequestFn = Box::new(move |_message, _tlvs| {
			if let Some(device) = weak.upgrade() {
				device.borrow_mut().release_users -= 1;
			}
		});

		let mut param = Param::new();
		if param.append(0x01, &[self.type_, self.client_id]).is_err() {
			return;
		}

		let req = Request::new(
			SERVICE_CONTROL,
			0x00,
			ctl::RELEASE_CLIENT_ID,
			Some(&param),
			callback,
		);
		inner.submit(req);
	}
}
