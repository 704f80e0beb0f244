//! Cache assembly pipeline: dependency graph, segment placement, per-dylib
//! rebasing and binding, the LINKEDIT merge, and the slide-info builder.
//! Built on the read view in the `macho-view` crate.

pub mod binder;
pub mod builder;
pub mod depgraph;
pub mod error;
pub mod header;
pub mod linkedit;
pub mod placer;
pub mod rebaser;
pub mod slideinfo;
pub mod source;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, ErrorKind, Result, Warning};
