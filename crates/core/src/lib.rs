//! hidport-core: portable raw HID access.
//!
//! This crate selects, per build target, a polling model (readiness or
//! completion) and a threading model (portable or native), and exposes one
//! device façade on top of whichever pair is active.

pub mod config;
pub mod device;
pub mod error;
pub mod platform;
pub mod poll;
pub mod source;
pub mod threading;

pub use device::{Backends, DeviceHandle, DeviceInfo, HidContext};
pub use error::{Error, ErrorKind, Result};
pub use platform::{PlatformProfile, PlatformTag, PollModel, ThreadModel};
pub use poll::Timeout;
