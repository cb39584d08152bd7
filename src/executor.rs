//! Cooperative scheduling for the single-threaded stack.
//!
//! The device never runs an event loop of its own; it is handed a
//! [`Scheduler`] at construction and registers fd watches and timers with
//! it. Watch and timer callbacks remove themselves by returning
//! [`WatchAction::Remove`] or [`TimerAction::Stop`].
//!
//! [`MainLoop`] is the bundled `poll(2)`-backed implementation. Hosts with
//! their own reactor implement [`Scheduler`] instead and drive the device
//! from there.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
	/// I/O readiness conditions, mirroring `poll(2)` events.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct IoCondition: u16 {
		const IN = libc::POLLIN as u16;
		const OUT = libc::POLLOUT as u16;
		const HUP = libc::POLLHUP as u16;
		const ERR = libc::POLLERR as u16;
		const NVAL = libc::POLLNVAL as u16;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
	Keep,
	Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
	Again,
	Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u32);

pub type WatchFn = Box<dyn FnMut(IoCondition) -> WatchAction>;
pub type TimerFn = Box<dyn FnMut() -> TimerAction>;

/// The scheduling interface the device is constructed over.
///
/// All methods take `&self`; implementations are expected to use interior
/// mutability and to tolerate being called from inside their own
/// callbacks.
pub trait Scheduler {
	/// Arms a watch on `fd` for the given conditions.
	fn watch(&self, fd: RawFd, interest: IoCondition, callback: WatchFn) -> WatchId;

	/// Disarms a watch. Safe against identifiers that already removed
	/// themselves.
	fn unwatch(&self, id: WatchId);

	/// Arms a timer. A zero delay fires on the next loop turn; a timer
	/// returning [`TimerAction::Again`] re-arms with the same delay.
	fn timeout(&self, delay: Duration, callback: TimerFn) -> TimerId;

	/// Cancels a timer. Safe against identifiers that already fired and
	/// stopped.
	fn cancel_timeout(&self, id: TimerId);
}

struct WatchSlot {
	id: u32,
	fd: RawFd,
	interest: IoCondition,
	/// Taken out while the callback runs, so reentrant removal of the
	/// slot degrades to marking it dead.
	callback: Option<WatchFn>,
	dead: bool,
}

struct TimerSlot {
	id: u32,
	deadline: Instant,
	period: Duration,
	callback: Option<TimerFn>,
	dead: bool,
}

/// A `poll(2)`-based single-threaded event loop.
pub struct MainLoop {
	watches: RefCell<Vec<WatchSlot>>,
	timers: RefCell<Vec<TimerSlot>>,
	next_id: Cell<u32>,
	quit: Cell<bool>,
}

impl Default for MainLoop {
	fn default() -> Self {
		Self::new()
	}
}

impl MainLoop {
	pub fn new() -> Self {
		Self {
			watches: RefCell::new(Vec::new()),
			timers: RefCell::new(Vec::new()),
			next_id: Cell::new(1),
			quit: Cell::new(false),
		}
	}

	fn alloc_id(&self) -> u32 {
		let id = self.next_id.get();
		self.next_id.set(id.checked_add(1).unwrap_or(1));
		id
	}

	/// Runs one poll-and-dispatch round. Blocks until a watch fires, a
	/// timer is due or `max_wait` passes; returns whether any callback was
	/// dispatched.
	pub fn iterate(&self, max_wait: Option<Duration>) -> bool {
		let now = Instant::now();

		let next_deadline = self
			.timers
			.borrow()
			.iter()
			.filter(|timer| !timer.dead)
			.map(|timer| timer.deadline)
			.min();

		let wait = match (next_deadline, max_wait) {
			(Some(deadline), Some(max)) => Some(deadline.saturating_duration_since(now).min(max)),
			(Some(deadline), None) => Some(deadline.saturating_duration_since(now)),
			(None, Some(max)) => Some(max),
			(None, None) => None,
		};

		let mut pollfds = Vec::new();
		let mut ids = Vec::new();
		for watch in self
			.watches
			.borrow()
			.iter()
			.filter(|watch| !watch.dead && watch.callback.is_some())
		{
			ids.push(watch.id);
			pollfds.push(libc::pollfd {
				fd: watch.fd,
				events: watch.interest.bits() as i16,
				revents: 0,
			});
		}

		if pollfds.is_empty() && wait.is_none() {
			return false;
		}

		let timeout_ms = match wait {
			Some(wait) => {
				let mut ms = i32::try_from(wait.as_millis()).unwrap_or(i32::MAX);
				if Duration::from_millis(ms as u64) < wait {
					ms = ms.saturating_add(1);
				}
				ms
			}
			None => -1,
		};

		let ready = unsafe {
			libc::poll(
				pollfds.as_mut_ptr(),
				pollfds.len() as libc::nfds_t,
				timeout_ms,
			)
		};
		if ready < 0 {
			return false;
		}

		let mut dispatched = false;

		for (index, id) in ids.iter().enumerate() {
			let revents = pollfds[index].revents;
			if revents == 0 {
				continue;
			}

			let callback = {
				let mut watches = self.watches.borrow_mut();
				match watches.iter_mut().find(|w| w.id == *id && !w.dead) {
					Some(slot) => slot.callback.take(),
					None => None,
				}
			};
			let Some(mut callback) = callback else {
				continue;
			};

			let action = callback(IoCondition::from_bits_truncate(revents as u16));
			dispatched = true;

			let mut watches = self.watches.borrow_mut();
			if let Some(pos) = watches.iter().position(|w| w.id == *id) {
				if watches[pos].dead || action == WatchAction::Remove {
					watches.remove(pos);
				} else {
					watches[pos].callback = Some(callback);
				}
			}
		}

		let now = Instant::now();
		let due: Vec<u32> = self
			.timers
			.borrow()
			.iter()
			.filter(|timer| !timer.dead && timer.deadline <= now)
			.map(|timer| timer.id)
			.collect();

		for id in due {
			let callback = {
				let mut timers = self.timers.borrow_mut();
				match timers.iter_mut().find(|t| t.id == id && !t.dead) {
					Some(slot) => slot.callback.take(),
					None => None,
				}
			};
			let Some(mut callback) = callback else {
				continue;
			};

			let action = callback();
			dispatched = true;

			let mut timers = self.timers.borrow_mut();
			if let Some(pos) = timers.iter().position(|t| t.id == id) {
				if timers[pos].dead || action == TimerAction::Stop {
					timers.remove(pos);
				} else {
					let period = timers[pos].period;
					timers[pos].deadline = Instant::now() + period;
					timers[pos].callback = Some(callback);
				}
			}
		}

		dispatched
	}

	/// Iterates until [`quit`](Self::quit) is called.
	pub fn run(&self) {
		self.quit.set(false);
		while !self.quit.get() {
			self.iterate(None);
		}
	}

	pub fn quit(&self) {
		self.quit.set(true);
	}
}

impl Scheduler for MainLoop {
	fn watch(&self, fd: RawFd, interest: IoCondition, callback: WatchFn) -> WatchId {
		let id = self.alloc_id();
		self.watches.borrow_mut().push(WatchSlot {
			id,
			fd,
			interest,
			callback: Some(callback),
			dead: false,
		});
		WatchId(id)
	}

	fn unwatch(&self, id: WatchId) {
		let mut watches = self.watches.borrow_mut();
		if let Some(pos) = watches.iter().position(|w| w.id == id.0) {
			if watches[pos].callback.is_some() {
				watches.remove(pos);
			} else {
				// In flight; the dispatcher drops it when the callback
				// returns.
				watches[pos].dead = true;
			}
		}
	}

	fn timeout(&self, delay: Duration, callback: TimerFn) -> TimerId {
		let id = self.alloc_id();
		self.timers.borrow_mut().push(TimerSlot {
			id,
			deadline: Instant::now() + delay,
			period: delay,
			callback: Some(callback),
			dead: false,
		});
		TimerId(id)
	}

	fn cancel_timeout(&self, id: TimerId) {
		let mut timers = self.timers.borrow_mut();
		if let Some(pos) = timers.iter().position(|t| t.id == id.0) {
			if timers[pos].callback.is_some() {
				timers.remove(pos);
			} else {
				timers[pos].dead = true;
			}
		}
	}
}
