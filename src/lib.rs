#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod audio;
pub mod code;
pub mod config;
pub mod fixup;
pub mod hook;
pub mod host;
pub mod patcher;
pub mod pattern;
pub mod router;
pub mod service;
pub mod watch;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use fixup::Fixup;
