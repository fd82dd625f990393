//! FUSE filesystem implementation
//!
//! The relay implements every operation against the lower tree by path.
//! `GuardFs` adapts it to fuser's inode-based callbacks.

mod filesystem;
mod handle;
mod inode;
mod relay;
mod resolver;

pub use filesystem::GuardFs;
pub use handle::{HandleManager, OpenHandle};
pub use inode::{InodeTable, ROOT_INO};
pub use relay::{DirEntry, FileStat, FsStat, OperationRelay};
pub use resolver::PathResolver;
