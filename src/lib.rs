//! Mounts a remote SFTP directory tree as a read-only FUSE filesystem, pulling bytes down into
//! a resumable local mirror as they are actually read rather than copying the whole tree
//! up front.

pub mod config;
pub mod controller;
pub mod error;
pub mod fs;
pub mod logging;
pub mod metadata;
pub mod pool;
pub mod source;
pub mod target;

pub use error::{Error, Result};
