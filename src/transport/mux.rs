//! The character-device mux transport.
//!
//! Reads and writes complete mux frames over a non-blocking file
//! descriptor, typically a `cdc-wdm` character device. Writing is
//! best-effort: a request that cannot be written in one go is dropped and
//! the writer disarmed; the rest of the pending queue is retried on the
//! next writability event.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use super::{Request, Transport, TxContext};
use crate::device::{self, Inner};
use crate::executor::{IoCondition, Scheduler, WatchId};

pub(crate) struct MuxTransport {
	fd: RawFd,
	close_on_drop: bool,
	read_watch: Option<WatchId>,
	write_watch: Option<WatchId>,
}

impl MuxTransport {
	/// Takes over an already-open character device and puts it into
	/// non-blocking mode. The descriptor is closed on drop only when
	/// [`set_close_on_drop`](Self::set_close_on_drop) asked for it.
	pub fn new(fd: RawFd) -> io::Result<Self> {
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
		if flags < 0 {
			return Err(io::Error::last_os_error());
		}

		if flags & libc::O_NONBLOCK == 0
			&& unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
		{
			return Err(io::Error::last_os_error());
		}

		Ok(Self {
			fd,
			close_on_drop: false,
			read_watch: None,
			write_watch: None,
		})
	}

	pub fn fd(&self) -> RawFd {
		self.fd
	}

	pub fn set_close_on_drop(&mut self, close: bool) {
		self.close_on_drop = close;
	}

	pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
		let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
		if n < 0 {
			Err(io::Error::last_os_error())
		} else {
			Ok(n as usize)
		}
	}

	pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
		if n < 0 {
			Err(io::Error::last_os_error())
		} else {
			Ok(n as usize)
		}
	}

	/// Arms the write watch unless it is armed already.
	pub fn wakeup_writer(&mut self, device: &Weak<RefCell<Inner>>, sched: &Rc<dyn Scheduler>) {
		if self.write_watch.is_some() {
			return;
		}

		let weak = device.clone();
		self.write_watch = Some(sched.watch(
			self.fd,
			IoCondition::OUT | IoCondition::HUP | IoCondition::ERR | IoCondition::NVAL,
			Box::new(move |_cond| device::mux_writable(&weak)),
		));
	}

	pub fn clear_write_watch(&mut self) {
		self.write_watch = None;
	}

	pub fn clear_read_watch(&mut self) {
		self.read_watch = None;
	}
}

impl Transport for MuxTransport {
	fn attach(&mut self, device: &Weak<RefCell<Inner>>, sched: &Rc<dyn Scheduler>) {
		let weak = device.clone();
		self.read_watch = Some(sched.watch(
			self.fd,
			IoCondition::IN | IoCondition::HUP | IoCondition::ERR | IoCondition::NVAL,
			Box::new(move |cond| device::mux_readable(&weak, cond)),
		));
	}

	fn submit(&mut self, ctx: TxContext<'_>, req: Request) {
		ctx.queues.push_pending(req);
		self.wakeup_writer(ctx.device, ctx.sched);
	}

	fn needs_release(&self) -> bool {
		true
	}

	fn detach(&mut self, sched: &Rc<dyn Scheduler>) {
		if let Some(id) = self.write_watch.take() {
			sched.unwatch(id);
		}
		if let Some(id) = self.read_watch.take() {
			sched.unwatch(id);
		}
	}
}

impl Drop for MuxTransport {
	fn drop(&mut self) {
		if self.close_on_drop {
			unsafe {
				libc::close(self.fd);
			}
		}
	}
}
