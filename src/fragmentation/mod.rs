//! Fragmented Data Block Transport package (port 201).

pub mod package;
pub mod session;

pub use package::{FragmentationPackage, Reply as FragReply, PORT};
pub use session::{FragOutcome, FragSession};
