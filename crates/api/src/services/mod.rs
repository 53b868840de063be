//! RPC services exposed through the dispatch router.
//!
//! - `db`: store lifecycle (provisioning jobs, drop, rename, listing)
//! - `common`: login, version information, job statistics
//! - `report`: document rendering jobs

pub mod common;
pub mod db;
pub mod report;

pub use common::CommonService;
pub use db::{DbService, DbSettings};
pub use report::ReportService;

/// Version reported by `db.server_version` and `common.version`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the RPC surface.
pub const PROTOCOL_VERSION: u32 = 1;
