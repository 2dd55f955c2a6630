//! nanlink Harness
//!
//! An in-memory radio discovery and link substrate. Devices share an
//! `Airspace`, find each other by service name and pair link requests, while
//! a `Recorder` keeps the order of every substrate call for assertions.
//! Stream traffic is real loopback TCP and does not pass through here.

pub mod airspace;
pub mod recorder;

pub use airspace::{Airspace, AirspaceFaults, Device};
pub use recorder::Recorder;
