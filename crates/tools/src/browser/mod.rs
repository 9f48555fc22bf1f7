//! Browser control over two paths into one shared browser.
//!
//! - Direct path: a CDP connection for pointer, keyboard, navigation and
//!   script evaluation (`surface`, `cdp`).
//! - Protocol path: the inspection server, reached over MCP, for
//!   accessibility snapshots and its other tools.
//!
//! [`BrowserRouter`] owns the connection lifecycle and decides which path an
//! action takes; [`BrowserTool`] exposes it to the tool registry.

pub mod action;
pub mod cdp;
pub mod coords;
pub mod error;
pub mod launcher;
pub mod router;
pub mod snapshot;
pub mod surface;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{ActionOutput, BrowserAction, ScrollDirection};
pub use error::{BrowserError, BrowserResult};
pub use router::{BrowserRouter, ConnectionState, RouterOptions};
pub use snapshot::{Snapshot, SnapshotNode};
pub use tool::BrowserTool;
