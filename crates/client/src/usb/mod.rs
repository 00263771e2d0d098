//! Local USB side: device discovery, filtering and access
//!
//! - `backend`: native USB interface the rest of the crate is written against
//! - `rusb_backend`: libusb implementation
//! - `registry`: currently present devices keyed by identity
//! - `filter`: rule sets deciding which devices may be redirected
//! - `event_thread`: background thread pumping native USB events
//! - `acl`: client for the privileged access-control helper

pub mod acl;
pub mod backend;
pub mod event_thread;
pub mod filter;
pub mod registry;
pub mod rusb_backend;

pub use acl::{AclError, AclGrant, AclHelper};
pub use backend::{BackendError, HotplugRegistration, UsbBackend, UsbDeviceHandle};
pub use event_thread::EventThread;
pub use filter::{DEFAULT_AUTO_CONNECT_FILTER, FilterParseError, FilterRule, FilterRules};
pub use registry::{AddOutcome, Arrival, DeviceRegistry, RegisteredDevice};
pub use rusb_backend::RusbBackend;
