//! Hardware Discovery Module
//!
//! Discovers whole, unpartitioned SATA disks on Linux hosts from the
//! JSON output of a block device enumeration command.

pub mod filter;
pub mod lsblk;

pub use filter::*;
pub use lsblk::*;
