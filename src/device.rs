//! The device core: one modem connection.
//!
//! A [`Device`] owns the transport, the request queues, the service
//! registry and the discovered version table. Cloning a handle is
//! reference acquisition; dropping the last clone tears the connection
//! down, running the destructors of everything still queued.
//!
//! Inbound traffic is demultiplexed here: responses are matched against
//! the awaiting-reply queues by transaction identifier, indications fan
//! out to the registered services. User callbacks never run while the
//! device state is borrowed, so they are free to call back into the API.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{trace, warn};
use smallvec::SmallVec;

use crate::config::{DISCOVER_TIMEOUT, RECV_BUF_SIZE, SERVICE_CREATE_TIMEOUT};
use crate::ctl;
use crate::debug::{DebugSink, debug_line, hexdump, trace_message};
use crate::error::Error;
use crate::executor::{IoCondition, Scheduler, TimerAction, TimerId, WatchAction};
use crate::service::{Service, ServiceInner, deliver_notifications};
use crate::services::{SERVICE_CONTROL, service_type_name};
use crate::sysfs::{self, DataFormat};
use crate::tlv::{Param, QmiResult, tlv_get};
use crate::transport::mux::MuxTransport;
use crate::transport::qrtr::{
	CTRL_PKT_SIZE, Endpoint, QRTR_PORT_CTRL, QrtrCommand, QrtrSocket, QrtrTransport, send_lookup,
};
use crate::transport::{ModemTransport, Request, RequestFn, RequestQueues, Transport, TxContext};
use crate::wire::{
	self, BROADCAST_CLIENT, ControlKind, ControlMessage, Frame, FrameReader, MUX_HDR_SIZE,
	ServiceKind, ServiceMessage,
};

/// One discovered service: its version and, on QRTR, its address.
pub(crate) struct ServiceVersion {
	pub type_: u8,
	pub major: u16,
	pub minor: u16,
	pub node: u16,
	pub port: u16,
	pub name: Option<&'static str>,
}

type VersionTable = SmallVec<[ServiceVersion; 8]>;

/// Registry key of a live client.
pub(crate) fn service_key(service: u8, client: u8) -> u16 {
	u16::from(service) | (u16::from(client) << 8)
}

struct DiscoverData {
	func: Option<Box<dyn FnOnce()>>,
	tid: u16,
	timeout: Option<TimerId>,
}

struct ServiceCreateData {
	type_: u8,
	major: u16,
	minor: u16,
	tid: u16,
	func: Option<Box<dyn FnOnce(Option<Service>)>>,
	timeout: Option<TimerId>,
}

struct ServiceCreateSharedData {
	service: Option<Service>,
	func: Option<Box<dyn FnOnce(Option<Service>)>>,
	timeout: Option<TimerId>,
}

/// An in-flight discovery-queue operation. Everything in here is dropped
/// (running the captured destructors) when the device goes away with the
/// operation still outstanding.
enum Discovery {
	Discover(Rc<RefCell<DiscoverData>>),
	ServiceCreate(Rc<RefCell<ServiceCreateData>>),
	ServiceCreateShared(Rc<RefCell<ServiceCreateSharedData>>),
}

impl Discovery {
	fn is(&self, other: &Discovery) -> bool {
		match (self, other) {
			(Discovery::Discover(a), Discovery::Discover(b)) => Rc::ptr_eq(a, b),
			(Discovery::ServiceCreate(a), Discovery::ServiceCreate(b)) => Rc::ptr_eq(a, b),
			(Discovery::ServiceCreateShared(a), Discovery::ServiceCreateShared(b)) => {
				Rc::ptr_eq(a, b)
			}
			_ => false,
		}
	}

	fn cancel_timer(&self, sched: &Rc<dyn Scheduler>) {
		let timeout = match self {
			Discovery::Discover(data) => data.borrow_mut().timeout.take(),
			Discovery::ServiceCreate(data) => data.borrow_mut().timeout.take(),
			Discovery::ServiceCreateShared(data) => data.borrow_mut().timeout.take(),
		};
		if let Some(id) = timeout {
			sched.cancel_timeout(id);
		}
	}
}

pub(crate) struct Inner {
	pub(crate) sched: Rc<dyn Scheduler>,
	pub(crate) self_weak: Weak<RefCell<Inner>>,
	pub(crate) transport: ModemTransport,
	pub(crate) queues: RequestQueues,
	pub(crate) services: HashMap<u16, Weak<ServiceInner>>,
	versions: VersionTable,
	/// Whether the version table reflects an actual enumeration. An empty
	/// but enumerated table is not the same as a pristine one.
	have_versions: bool,
	control_major: u16,
	control_minor: u16,
	version_str: Option<String>,
	next_cid: u8,
	pub(crate) debug: Option<DebugSink>,
	discovery: Vec<Discovery>,
	pub(crate) release_users: u32,
	shutdown_timer: Option<TimerId>,
	shutting_down: bool,
}

impl Inner {
	/// Assigns a transaction identifier and hands the request to the
	/// transport. Requests transmit in submission order.
	pub(crate) fn submit(&mut self, mut req: Request) -> u16 {
		let tid = self.queues.assign_tid(&mut req);

		let Inner {
			sched,
			self_weak,
			transport,
			queues,
			services,
			debug,
			..
		} = self;

		transport.submit(
			TxContext {
				sched,
				device: self_weak,
				queues,
				services,
				debug,
			},
			req,
		);

		tid
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		debug_line(&mut self.debug, format_args!("device free"));

		self.queues.clear();

		for op in std::mem::take(&mut self.discovery) {
			op.cancel_timer(&self.sched);
		}

		if let Some(id) = self.shutdown_timer.take() {
			self.sched.cancel_timeout(id);
		}

		let sched = self.sched.clone();
		self.transport.detach(&sched);
	}
}

/// The root handle of one modem connection.
#[derive(Clone)]
pub struct Device {
	inner: Rc<RefCell<Inner>>,
}

impl Device {
	/// Wraps an already-open character device carrying framed QMI mux
	/// packets. The descriptor is switched to non-blocking mode; it is
	/// closed on final drop only after
	/// [`set_close_on_drop`](Self::set_close_on_drop).
	pub fn new(fd: RawFd, sched: Rc<dyn Scheduler>) -> Result<Self, Error> {
		let transport = ModemTransport::Mux(MuxTransport::new(fd)?);
		Ok(Self::with_transport(transport, sched))
	}

	/// Opens an AF_QIPCRTR socket talking to the given node. The socket
	/// is owned by the device.
	pub fn new_qrtr(node: u32, sched: Rc<dyn Scheduler>) -> Result<Self, Error> {
		let endpoint = QrtrSocket::new()?;
		Ok(Self::new_qrtr_with_endpoint(node, Box::new(endpoint), sched))
	}

	/// A QRTR device over a custom datagram carrier.
	pub fn new_qrtr_with_endpoint(
		node: u32,
		endpoint: Box<dyn Endpoint>,
		sched: Rc<dyn Scheduler>,
	) -> Self {
		Self::with_transport(
			ModemTransport::Qrtr(QrtrTransport::new(node, endpoint)),
			sched,
		)
	}

	fn with_transport(transport: ModemTransport, sched: Rc<dyn Scheduler>) -> Self {
		let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner>>| {
			RefCell::new(Inner {
				sched: sched.clone(),
				self_weak: weak.clone(),
				transport,
				queues: RequestQueues::new(),
				services: HashMap::new(),
				versions: VersionTable::new(),
				have_versions: false,
				control_major: 0,
				control_minor: 0,
				version_str: None,
				next_cid: 1,
				debug: None,
				discovery: Vec::new(),
				release_users: 0,
				shutdown_timer: None,
				shutting_down: false,
			})
		});

		{
			let mut borrow = inner.borrow_mut();
			let this = &mut *borrow;
			let weak = this.self_weak.clone();
			let sched = this.sched.clone();
			this.transport.attach(&weak, &sched);
		}

		Device { inner }
	}

	/// Installs the sink receiving wire traces and life-cycle one-liners.
	/// The sink must not call back into the device.
	pub fn set_debug(&self, func: impl FnMut(&str) + 'static) {
		self.inner.borrow_mut().debug = Some(Box::new(func));
	}

	pub fn clear_debug(&self) {
		self.inner.borrow_mut().debug = None;
	}

	/// Whether the mux file descriptor is closed when the last handle
	/// drops. Off by default; irrelevant on QRTR.
	pub fn set_close_on_drop(&self, close: bool) {
		if let ModemTransport::Mux(mux) = &mut self.inner.borrow_mut().transport {
			mux.set_close_on_drop(close);
		}
	}

	/// Enumerates the modem's services. On mux transports this queries
	/// the control service; on QRTR it asks the router for announcements
	/// that keep arriving for the lifetime of the socket. The callback
	/// fires once the version table is ready, or after five seconds with
	/// whatever has been collected.
	pub fn discover(&self, func: impl FnOnce() + 'static) -> Result<(), Error> {
		let mut inner = self.inner.borrow_mut();

		debug_line(&mut inner.debug, format_args!("device discover"));

		let data = Rc::new(RefCell::new(DiscoverData {
			func: Some(Box::new(func)),
			tid: 0,
			timeout: None,
		}));
		let weak = inner.self_weak.clone();

		if inner.have_versions {
			// Already enumerated; report on the next loop turn.
			let data2 = data.clone();
			let id = inner.sched.timeout(
				Duration::ZERO,
				Box::new(move || {
					discover_reply(&weak, &data2);
					TimerAction::Stop
				}),
			);
			data.borrow_mut().timeout = Some(id);
			inner.discovery.push(Discovery::Discover(data));
			return Ok(());
		}

		if let ModemTransport::Qrtr(qrtr) = &inner.transport {
			send_lookup(qrtr.endpoint.as_ref())?;
		} else {
			let (weak2, data2) = (weak.clone(), data.clone());
			let callback: RequestFn =
				Box::new(move |message, tlvs| discover_callback(&weak2, &data2, message, tlvs));

			let req = Request::new(SERVICE_CONTROL, 0x00, ctl::GET_VERSION_INFO, None, callback);
			let tid = inner.submit(req);
			data.borrow_mut().tid = tid;
		}

		let data2 = data.clone();
		let id = inner.sched.timeout(
			DISCOVER_TIMEOUT,
			Box::new(move || {
				discover_reply(&weak, &data2);
				TimerAction::Stop
			}),
		);
		data.borrow_mut().timeout = Some(id);
		inner.discovery.push(Discovery::Discover(data));

		Ok(())
	}

	/// Whether the given service type showed up in discovery.
	pub fn has_service(&self, service: u8) -> bool {
		self.inner
			.borrow()
			.versions
			.iter()
			.any(|version| version.type_ == service)
	}

	/// The discovered (major, minor) version of a service.
	pub fn service_version(&self, service: u8) -> Option<(u16, u16)> {
		self.inner
			.borrow()
			.versions
			.iter()
			.find(|version| version.type_ == service)
			.map(|version| (version.major, version.minor))
	}

	/// The firmware version string reported during discovery, if any.
	pub fn version_string(&self) -> Option<String> {
		self.inner.borrow().version_str.clone()
	}

	/// Resets the modem-side client state. Mux only; QRTR has no control
	/// service.
	pub fn sync(&self, func: impl FnOnce() + 'static) -> Result<(), Error> {
		let mut inner = self.inner.borrow_mut();

		if matches!(inner.transport, ModemTransport::Qrtr(_)) {
			return Err(Error::NotSupported);
		}

		debug_line(&mut inner.debug, format_args!("sending sync to reset state"));

		let callback: RequestFn = Box::new(move |_message, _tlvs| func());
		let req = Request::new(SERVICE_CONTROL, 0x00, ctl::SYNC, None, callback);
		inner.submit(req);

		Ok(())
	}

	/// Whether the control service is recent enough (1.5) for
	/// [`sync`](Self::sync).
	pub fn is_sync_supported(&self) -> bool {
		let inner = self.inner.borrow();

		if matches!(inner.transport, ModemTransport::Qrtr(_)) {
			return false;
		}

		inner.control_major > 1 || (inner.control_major == 1 && inner.control_minor >= 5)
	}

	/// Allocates a client for the given service type, sharing an already
	/// registered one when possible. The callback receives the handle, or
	/// `None` if the modem did not answer within eight seconds.
	pub fn create_service(
		&self,
		service: u8,
		func: impl FnOnce(Option<Service>) + 'static,
	) -> Result<(), Error> {
		self.create_shared_service(service, func)
	}

	/// See [`create_service`](Self::create_service); every creation is
	/// shared.
	pub fn create_shared_service(
		&self,
		service: u8,
		func: impl FnOnce(Option<Service>) + 'static,
	) -> Result<(), Error> {
		let mut inner = self.inner.borrow_mut();

		if service == SERVICE_CONTROL {
			return Err(Error::InvalidService);
		}

		let existing = inner
			.services
			.values()
			.filter_map(Weak::upgrade)
			.find(|svc| svc.type_ == service);

		if let Some(existing) = existing {
			let data = Rc::new(RefCell::new(ServiceCreateSharedData {
				service: Some(Service::from_inner(existing)),
				func: Some(Box::new(func)),
				timeout: None,
			}));

			let weak = inner.self_weak.clone();
			let data2 = data.clone();
			let id = inner.sched.timeout(
				Duration::ZERO,
				Box::new(move || {
					service_create_shared_reply(&weak, &data2);
					TimerAction::Stop
				}),
			);
			data.borrow_mut().timeout = Some(id);
			inner.discovery.push(Discovery::ServiceCreateShared(data));

			return Ok(());
		}

		if matches!(inner.transport, ModemTransport::Qrtr(_)) {
			qrtr_service_create(&mut inner, service, Box::new(func))
		} else {
			service_create(&mut inner, service, Box::new(func))
		}
	}

	/// Schedules shutdown. The callback fires once every in-flight client
	/// release has been answered; until then the check re-arms itself.
	pub fn shutdown(&self, func: impl FnOnce() + 'static) -> Result<(), Error> {
		let mut inner = self.inner.borrow_mut();

		if inner.shutting_down || inner.shutdown_timer.is_some() {
			return Err(Error::InProgress);
		}

		debug_line(&mut inner.debug, format_args!("device shutdown"));

		let weak = inner.self_weak.clone();
		let mut func = Some(func);
		let id = inner.sched.timeout(
			Duration::ZERO,
			Box::new(move || {
				let Some(device) = weak.upgrade() else {
					return TimerAction::Stop;
				};

				{
					let mut inner = device.borrow_mut();
					if inner.release_users > 0 {
						return TimerAction::Again;
					}
					inner.shutting_down = true;
					inner.shutdown_timer = None;
				}

				if let Some(func) = func.take() {
					func();
				}
				TimerAction::Stop
			}),
		);
		inner.shutdown_timer = Some(id);

		Ok(())
	}

	/// Reads the kernel's expected-data-format toggle for the network
	/// interface behind the mux descriptor.
	pub fn expected_data_format(&self) -> Option<DataFormat> {
		let inner = self.inner.borrow();
		let ModemTransport::Mux(mux) = &inner.transport else {
			return None;
		};
		sysfs::expected_data_format(mux.fd())
	}

	/// Flips the kernel's expected-data-format toggle.
	pub fn set_expected_data_format(&self, format: DataFormat) -> Result<(), Error> {
		let inner = self.inner.borrow();
		let ModemTransport::Mux(mux) = &inner.transport else {
			return Err(Error::NotSupported);
		};
		sysfs::set_expected_data_format(mux.fd(), format)
	}
}

fn discovery_complete(inner: &mut Inner, target: &Discovery) {
	if let Some(pos) = inner.discovery.iter().position(|op| op.is(target)) {
		let op = inner.discovery.remove(pos);
		op.cancel_timer(&inner.sched);
	}
}

fn discover_callback(
	weak: &Weak<RefCell<Inner>>,
	data: &Rc<RefCell<DiscoverData>>,
	_message: u16,
	tlvs: &[u8],
) {
	let Some(device) = weak.upgrade() else {
		return;
	};

	let func = {
		let mut inner = device.borrow_mut();
		let mut table = VersionTable::new();
		let mut parsed = false;

		'parse: {
			let Some(code) = tlv_get(tlvs, 0x02) else {
				break 'parse;
			};
			if code.len() != ctl::RESULT_CODE_SIZE {
				break 'parse;
			}

			let Some(list) = tlv_get(tlvs, 0x01) else {
				break 'parse;
			};
			if list.len() < ctl::SERVICE_LIST_SIZE {
				break 'parse;
			}

			let count = usize::from(list[0]);
			let mut offset = ctl::SERVICE_LIST_SIZE;

			for _ in 0..count {
				if offset + ctl::SERVICE_ENTRY_SIZE > list.len() {
					break;
				}

				let type_ = list[offset];
				let major = wire::get_u16(list, offset + 1);
				let minor = wire::get_u16(list, offset + 3);
				offset += ctl::SERVICE_ENTRY_SIZE;

				let name = service_type_name(type_);
				match name {
					Some(name) => debug_line(
						&mut inner.debug,
						format_args!("found service [{name} {major}.{minor}]"),
					),
					None => debug_line(
						&mut inner.debug,
						format_args!("found service [{type_} {major}.{minor}]"),
					),
				}

				// The control entry feeds the sync-support check, not the
				// user-visible version list.
				if type_ == SERVICE_CONTROL {
					inner.control_major = major;
					inner.control_minor = minor;
					continue;
				}

				table.push(ServiceVersion {
					type_,
					major,
					minor,
					node: 0,
					port: 0,
					name,
				});
			}

			parsed = true;

			if let Some(version) = tlv_get(tlvs, 0x10)
				&& !version.is_empty()
			{
				let len = usize::from(version[0]).min(version.len() - 1);
				inner.version_str =
					Some(String::from_utf8_lossy(&version[1..1 + len]).into_owned());
			}
		}

		inner.versions = table;
		inner.have_versions = parsed;

		discovery_complete(&mut inner, &Discovery::Discover(data.clone()));
		data.borrow_mut().func.take()
	};

	if let Some(func) = func {
		func();
	}
}

fn discover_reply(weak: &Weak<RefCell<Inner>>, data: &Rc<RefCell<DiscoverData>>) {
	let Some(device) = weak.upgrade() else {
		return;
	};

	let func = {
		let mut inner = device.borrow_mut();

		data.borrow_mut().timeout = None;

		// Drop the request the modem never answered.
		let tid = data.borrow().tid;
		if tid != 0 {
			let req = inner
				.queues
				.take_pending(tid)
				.or_else(|| inner.queues.take_control(tid as u8));
			drop(req);
		}

		discovery_complete(&mut inner, &Discovery::Discover(data.clone()));
		data.borrow_mut().func.take()
	};

	if let Some(func) = func {
		func();
	}
}

fn service_create(
	inner: &mut Inner,
	service: u8,
	func: Box<dyn FnOnce(Option<Service>)>,
) -> Result<(), Error> {
	if !inner.have_versions {
		return Err(Error::NoVersionInfo);
	}

	let Some(version) = inner.versions.iter().find(|v| v.type_ == service) else {
		return Err(Error::ServiceUnknown);
	};
	let (major, minor) = (version.major, version.minor);

	debug_line(
		&mut inner.debug,
		format_args!("service create [type={service}]"),
	);

	let data = Rc::new(RefCell::new(ServiceCreateData {
		type_: service,
		major,
		minor,
		tid: 0,
		func: Some(func),
		timeout: None,
	}));

	let weak = inner.self_weak.clone();
	let (weak2, data2) = (weak.clone(), data.clone());
	let callback: RequestFn =
		Box::new(move |message, tlvs| service_create_callback(&weak2, &data2, message, tlvs));

	let param = Param::new_u8(0x01, service)?;
	let req = Request::new(
		SERVICE_CONTROL,
		0x00,
		ctl::GET_CLIENT_ID,
		Some(&param),
		callback,
	);
	let tid = inner.submit(req);
	data.borrow_mut().tid = tid;

	let data2 = data.clone();
	let id = inner.sched.timeout(
		SERVICE_CREATE_TIMEOUT,
		Box::new(move || {
			service_create_reply(&weak, &data2);
			TimerAction::Stop
		}),
	);
	data.borrow_mut().timeout = Some(id);
	inner.discovery.push(Discovery::ServiceCreate(data));

	Ok(())
}

fn service_create_callback(
	weak: &Weak<RefCell<Inner>>,
	data: &Rc<RefCell<ServiceCreateData>>,
	_message: u16,
	tlvs: &[u8],
) {
	let Some(device) = weak.upgrade() else {
		return;
	};

	let (func, created) = {
		let mut inner = device.borrow_mut();
		let mut created = None;

		'parse: {
			let Some(code) = tlv_get(tlvs, 0x02) else {
				break 'parse;
			};
			if code.len() != ctl::RESULT_CODE_SIZE {
				break 'parse;
			}

			let Some(client) = tlv_get(tlvs, 0x01) else {
				break 'parse;
			};
			if client.len() != ctl::CLIENT_ID_SIZE {
				break 'parse;
			}

			let (type_, major, minor) = {
				let data = data.borrow();
				(data.type_, data.major, data.minor)
			};

			// The reply names the service type it allocated for.
			if client[0] != type_ {
				break 'parse;
			}
			let client_id = client[1];

			debug_line(
				&mut inner.debug,
				format_args!("service created [client={client_id},type={type_}]"),
			);

			let svc = Rc::new(ServiceInner::new(
				inner.self_weak.clone(),
				type_,
				major,
				minor,
				client_id,
				0,
			));
			inner
				.services
				.insert(service_key(type_, client_id), Rc::downgrade(&svc));

			created = Some(Service::from_inner(svc));
		}

		discovery_complete(&mut inner, &Discovery::ServiceCreate(data.clone()));
		(data.borrow_mut().func.take(), created)
	};

	if let Some(func) = func {
		func(created);
	}
}

fn service_create_reply(weak: &Weak<RefCell<Inner>>, data: &Rc<RefCell<ServiceCreateData>>) {
	let Some(device) = weak.upgrade() else {
		return;
	};

	let func = {
		let mut inner = device.borrow_mut();

		data.borrow_mut().timeout = None;

		let tid = data.borrow().tid;
		if tid != 0 {
			let req = inner
				.queues
				.take_pending(tid)
				.or_else(|| inner.queues.take_control(tid as u8));
			drop(req);
		}

		discovery_complete(&mut inner, &Discovery::ServiceCreate(data.clone()));
		data.borrow_mut().func.take()
	};

	if let Some(func) = func {
		func(None);
	}
}

fn service_create_shared_reply(
	weak: &Weak<RefCell<Inner>>,
	data: &Rc<RefCell<ServiceCreateSharedData>>,
) {
	let Some(device) = weak.upgrade() else {
		return;
	};

	let (func, service) = {
		let mut inner = device.borrow_mut();

		data.borrow_mut().timeout = None;
		discovery_complete(&mut inner, &Discovery::ServiceCreateShared(data.clone()));

		let mut data = data.borrow_mut();
		(data.func.take(), data.service.take())
	};

	if let Some(func) = func {
		func(service);
	}
}

/// Local client allocation: QRTR has no control service to ask, the
/// router already told us where the service lives.
fn qrtr_service_create(
	inner: &mut Inner,
	service: u8,
	func: Box<dyn FnOnce(Option<Service>)>,
) -> Result<(), Error> {
	if !inner.have_versions {
		return Err(Error::NoVersionInfo);
	}

	debug_line(
		&mut inner.debug,
		format_args!("service create [type={service}]"),
	);

	let Some(version) = inner.versions.iter().find(|v| v.type_ == service) else {
		return Err(Error::ServiceUnknown);
	};
	let (major, minor, port) = (version.major, version.minor, version.port);

	let client_id = inner.next_cid;
	inner.next_cid = inner.next_cid.wrapping_add(1);

	let svc = Rc::new(ServiceInner::new(
		inner.self_weak.clone(),
		service,
		major,
		minor,
		client_id,
		port,
	));

	debug_line(
		&mut inner.debug,
		format_args!("service created [client={client_id},type={service},port={port}]"),
	);

	inner
		.services
		.insert(service_key(service, client_id), Rc::downgrade(&svc));

	let data = Rc::new(RefCell::new(ServiceCreateSharedData {
		service: Some(Service::from_inner(svc)),
		func: Some(func),
		timeout: None,
	}));

	let weak = inner.self_weak.clone();
	let data2 = data.clone();
	let id = inner.sched.timeout(
		Duration::ZERO,
		Box::new(move || {
			service_create_shared_reply(&weak, &data2);
			TimerAction::Stop
		}),
	);
	data.borrow_mut().timeout = Some(id);
	inner.discovery.push(Discovery::ServiceCreateShared(data));

	Ok(())
}

/// Work taken out of the demultiplexer to run once the device borrow is
/// released: user callbacks may re-enter the API freely.
enum Dispatch<'a> {
	Response {
		callback: RequestFn,
		message: u16,
		tlvs: &'a [u8],
	},
	Indication {
		targets: Vec<Rc<ServiceInner>>,
		message: u16,
		tlvs: &'a [u8],
	},
}

fn run_dispatch(actions: Vec<Dispatch<'_>>) {
	for action in actions {
		match action {
			Dispatch::Response {
				callback,
				message,
				tlvs,
			} => callback(message, tlvs),
			Dispatch::Indication {
				targets,
				message,
				tlvs,
			} => {
				let result = QmiResult::indication(message, tlvs);
				for service in &targets {
					deliver_notifications(service, &result);
				}
			}
		}
	}
}

/// Routes an indication to the addressed service, or to every registered
/// one for the broadcast client. Control indications carry no payload the
/// stack consumes and are dropped.
fn indication<'a>(
	inner: &Inner,
	service: u8,
	client: u8,
	message: u16,
	tlvs: &'a [u8],
) -> Option<Dispatch<'a>> {
	if service == SERVICE_CONTROL {
		return None;
	}

	let targets: Vec<Rc<ServiceInner>> = if client == BROADCAST_CLIENT {
		inner.services.values().filter_map(Weak::upgrade).collect()
	} else {
		inner
			.services
			.get(&service_key(service, client))
			.and_then(Weak::upgrade)
			.into_iter()
			.collect()
	};

	if targets.is_empty() {
		return None;
	}

	Some(Dispatch::Indication {
		targets,
		message,
		tlvs,
	})
}

fn demux_frame<'a>(inner: &mut Inner, frame: &Frame<'a>) -> Option<Dispatch<'a>> {
	if frame.service == SERVICE_CONTROL {
		// Control traffic never carries a client identifier.
		if frame.client != 0x00 {
			return None;
		}

		let msg = ControlMessage::parse(frame.payload)?;

		if msg.kind == ControlKind::Indication as u8 && msg.transaction == 0 {
			return indication(inner, frame.service, frame.client, msg.message, msg.tlvs);
		}

		let req = inner.queues.take_control(msg.transaction)?;
		Some(Dispatch::Response {
			callback: req.callback?,
			message: msg.message,
			tlvs: msg.tlvs,
		})
	} else {
		let msg = ServiceMessage::parse(frame.payload)?;

		if msg.kind == ServiceKind::Indication as u8 {
			return indication(inner, frame.service, frame.client, msg.message, msg.tlvs);
		}

		let req = inner.queues.take_service(msg.transaction)?;
		Some(Dispatch::Response {
			callback: req.callback?,
			message: msg.message,
			tlvs: msg.tlvs,
		})
	}
}

/// Readable callback of the mux transport: one read, a left-to-right
/// frame scan, then dispatch.
pub(crate) fn mux_readable(weak: &Weak<RefCell<Inner>>, cond: IoCondition) -> WatchAction {
	let Some(device) = weak.upgrade() else {
		return WatchAction::Remove;
	};

	let mut scratch = [0u8; RECV_BUF_SIZE];
	let mut actions = Vec::new();

	{
		let mut inner = device.borrow_mut();

		if cond.contains(IoCondition::NVAL) {
			if let ModemTransport::Mux(mux) = &mut inner.transport {
				mux.clear_read_watch();
			}
			return WatchAction::Remove;
		}

		let read = {
			let ModemTransport::Mux(mux) = &inner.transport else {
				return WatchAction::Remove;
			};
			mux.read(&mut scratch)
		};

		let len = match read {
			Ok(0) => {
				if let ModemTransport::Mux(mux) = &mut inner.transport {
					mux.clear_read_watch();
				}
				return WatchAction::Remove;
			}
			Ok(len) => len,
			Err(_) => return WatchAction::Keep,
		};

		hexdump('<', &scratch[..len], &mut inner.debug);

		for frame in FrameReader::new(&scratch[..len]) {
			trace_message(' ', frame.bytes, &mut inner.debug);
			if let Some(action) = demux_frame(&mut inner, &frame) {
				actions.push(action);
			}
		}
	}

	run_dispatch(actions);
	WatchAction::Keep
}

/// Writable callback of the mux transport: pop the head of the pending
/// queue, write it in one go, file it under awaiting-reply.
pub(crate) fn mux_writable(weak: &Weak<RefCell<Inner>>) -> WatchAction {
	let Some(device) = weak.upgrade() else {
		return WatchAction::Remove;
	};
	let mut inner = device.borrow_mut();
	let this = &mut *inner;

	let ModemTransport::Mux(mux) = &mut this.transport else {
		return WatchAction::Remove;
	};

	let Some(mut req) = this.queues.pop_pending() else {
		mux.clear_write_watch();
		return WatchAction::Remove;
	};

	let buf = req.buf.take().expect("pending request has a frame");

	match mux.write(&buf) {
		Ok(n) if n == buf.len() => {}
		Ok(_) | Err(_) => {
			// Best-effort writer: this request is lost, the rest of the
			// queue is retried on the next writability event.
			warn!("dropping request {} after failed write", req.tid);
			mux.clear_write_watch();
			return WatchAction::Remove;
		}
	}

	hexdump('>', &buf, &mut this.debug);
	trace_message(' ', &buf, &mut this.debug);

	this.queues.push_awaiting(req);

	if this.queues.pending_is_empty() {
		mux.clear_write_watch();
		WatchAction::Remove
	} else {
		WatchAction::Keep
	}
}

/// Input callback of the QRTR transport. Control-port datagrams maintain
/// the version table; everything else is wrapped in a synthesized mux
/// header and demultiplexed like mux traffic.
pub(crate) fn qrtr_readable(weak: &Weak<RefCell<Inner>>, _cond: IoCondition) -> WatchAction {
	let Some(device) = weak.upgrade() else {
		return WatchAction::Remove;
	};

	let mut scratch = [0u8; RECV_BUF_SIZE];
	let mut action = None;

	{
		let mut inner = device.borrow_mut();

		let received = {
			let ModemTransport::Qrtr(qrtr) = &inner.transport else {
				return WatchAction::Remove;
			};
			qrtr.endpoint.recv_from(&mut scratch[MUX_HDR_SIZE..])
		};

		let (len, addr) = match received {
			Ok(received) => received,
			Err(err) if err.kind() == io::ErrorKind::WouldBlock => return WatchAction::Keep,
			Err(_) => return WatchAction::Remove,
		};

		trace!("qrtr datagram from node {} port {}", addr.node, addr.port);

		if addr.port == QRTR_PORT_CTRL {
			qrtr_handle_ctrl_packet(&mut inner, &scratch[MUX_HDR_SIZE..MUX_HDR_SIZE + len]);
			return WatchAction::Keep;
		}

		if len < MUX_HDR_SIZE {
			return WatchAction::Keep;
		}

		// Which client does this datagram belong to?
		let target = inner
			.services
			.values()
			.filter_map(Weak::upgrade)
			.find(|svc| u32::from(svc.port) == addr.port);
		let Some(target) = target else {
			return WatchAction::Keep;
		};

		let total = MUX_HDR_SIZE + len;
		scratch[0] = wire::FRAME_BYTE;
		scratch[1..3].copy_from_slice(&((total - 1) as u16).to_le_bytes());
		scratch[3] = wire::FLAGS_INBOUND;
		scratch[4] = target.type_;
		scratch[5] = target.client_id;

		hexdump('<', &scratch[..total], &mut inner.debug);

		let frame = Frame {
			bytes: &scratch[..total],
			service: scratch[4],
			client: scratch[5],
			payload: &scratch[MUX_HDR_SIZE..total],
		};
		action = demux_frame(&mut inner, &frame);
	}

	if let Some(action) = action {
		run_dispatch(vec![action]);
	}
	WatchAction::Keep
}

/// Maintains the version table from the router's NEW_SERVER / DEL_SERVER
/// announcements. Packets for foreign nodes are ignored.
fn qrtr_handle_ctrl_packet(inner: &mut Inner, payload: &[u8]) {
	if payload.len() < CTRL_PKT_SIZE {
		return;
	}

	let cmd = wire::get_u32(payload, 0);
	let service = wire::get_u32(payload, 4);
	let instance = wire::get_u32(payload, 8);
	let node = wire::get_u32(payload, 12);
	let port = wire::get_u32(payload, 16);

	let ModemTransport::Qrtr(qrtr) = &inner.transport else {
		return;
	};
	if node != qrtr.node_id {
		return;
	}

	match QrtrCommand::try_from(cmd) {
		Ok(QrtrCommand::NewServer) => {
			let type_ = service as u8;
			let major = (instance & 0xff) as u16;
			let minor = ((instance >> 8) & 0xff) as u16;

			let entry = ServiceVersion {
				type_,
				major,
				minor,
				node: node as u16,
				port: port as u16,
				name: service_type_name(type_),
			};

			debug_line(
				&mut inner.debug,
				format_args!(
					"found service [{type_} ({}) {major}.{minor}]",
					entry.name.unwrap_or("unknown")
				),
			);

			match inner
				.versions
				.iter_mut()
				.find(|v| v.node == entry.node && v.port == entry.port)
			{
				Some(existing) => *existing = entry,
				None => inner.versions.push(entry),
			}
			inner.have_versions = true;
		}
		Ok(QrtrCommand::DelServer) => {
			inner
				.versions
				.retain(|v| v.node != node as u16 || v.port != port as u16);
		}
		_ => {}
	}
}
