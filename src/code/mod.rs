//! # Code
//!
//! Architecture specific encoders for the bytes written into patched code

pub mod x64;
