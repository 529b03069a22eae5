// SPDX-License-Identifier: GPL-3.0-only

//! Low-level helpers for pool management
//!
//! This crate holds the pieces of pool management that need no agent
//! round-trip:
//! - Mount-option validation and the transport-based default heuristic
//! - Parsers for btrfs-progs output
//! - fstab/crypttab line construction
//! - Command rendering and the destroy cleanliness check
//! - Atomic file replacement for the durable stores
//!
//! Nothing here executes privileged commands; the agent does that.

pub mod btrfs_tools;
pub mod command;
pub mod durable;
pub mod error;
pub mod fstab;
pub mod heuristic;
pub mod mount_options;
pub mod mountpoint;
pub mod probe;

pub use error::{MountOptionError, Result, SysError};
pub use heuristic::{Transport, default_options};
pub use mount_options::validate as validate_mount_options;
