#![recursion_limit = "256"]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
extern crate libc;
extern crate pest;
extern crate pest_derive;
#[macro_use]
extern crate quick_error;
extern crate regex;
#[macro_use]
pub extern crate slog;
extern crate slog_stdlog;

// library modules
pub mod backup;
pub mod log;
pub mod migration;
pub mod parsers;
pub mod subvolume;
pub mod utils;
pub mod volume;

pub use crate::log::GlobalLogger;

/// Version of the crate. Attached to every logger created by this crate.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
