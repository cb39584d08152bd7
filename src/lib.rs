//! A QMI transport and multiplexing engine for cellular modems.
//!
//! One [`Device`] speaks to one modem, either through a character device
//! carrying framed QMI mux packets (`cdc-wdm`) or through the kernel's
//! QRTR datagram sockets. Higher layers obtain per-service [`Service`]
//! handles and use them for request/response traffic and indication
//! subscriptions; the device correlates concurrent transactions, shares
//! clients between holders and drains client releases on shutdown.
//!
//! The stack is single threaded and event driven. It owns no loop of its
//! own: construction takes a [`Scheduler`], with [`MainLoop`] as the
//! bundled `poll(2)` implementation.
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use qmi::{Device, MainLoop, ServiceType};
//!
//! let sched = Rc::new(MainLoop::new());
//! let device = Device::new_qrtr(0, sched.clone()).unwrap();
//!
//! let handle = device.clone();
//! device
//! 	.discover(move || {
//! 		handle
//! 			.create_service(ServiceType::Dms.into(), |service| {
//! 				let service = service.expect("DMS is available");
//! 				println!("DMS {:?}", service.version());
//! 			})
//! 			.expect("DMS was announced");
//! 	})
//! 	.unwrap();
//!
//! sched.run();
//! ```

mod config;
pub mod ctl;
mod debug;
mod device;
pub mod error;
pub mod executor;
mod service;
pub mod services;
mod sysfs;
pub mod tlv;
pub mod transport;
mod wire;

pub use device::Device;
pub use error::{Error, error_to_cme, error_to_string};
pub use executor::{IoCondition, MainLoop, Scheduler, TimerAction, TimerId, WatchAction, WatchId};
pub use service::Service;
pub use services::ServiceType;
pub use sysfs::DataFormat;
pub use tlv::{Param, QmiResult};
pub use transport::qrtr::{Endpoint, QrtrAddress, QrtrSocket};
