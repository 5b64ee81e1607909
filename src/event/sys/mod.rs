#![allow(unsafe_code)]

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub(crate) use self::linux::{FdWrapper, Poller, WakeHandle};

#[cfg(not(target_os = "linux"))]
compile_error!("no event provider for this platform");
