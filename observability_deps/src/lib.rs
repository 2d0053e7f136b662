//! This crate exists to coordinate the `tracing` version used across the
//! workspace: every crate takes its logging macros from this re-export, so
//! the ecosystem is updated in one place.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
