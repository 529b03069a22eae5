// SPDX-License-Identifier: GPL-3.0-only

//! Default mount options derived from device transport.

use std::fs;
use std::path::Path;

use tracing::debug;

pub const SOLID_STATE_OPTIONS: &str = "compress=zstd:3,noatime,ssd,discard=async";
pub const ROTATIONAL_OPTIONS: &str = "compress=zstd:3,noatime,autodefrag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    SolidState,
    Rotational,
}

pub fn options_for(transport: Transport) -> &'static str {
    match transport {
        Transport::SolidState => SOLID_STATE_OPTIONS,
        Transport::Rotational => ROTATIONAL_OPTIONS,
    }
}

/// Pick default options for a set of devices.
///
/// Only an all-solid-state set gets the SSD preset; any rotational or
/// unidentifiable member falls back to the rotational one.
pub fn default_options<S: AsRef<str>>(devices: &[S], sysfs_root: &Path) -> &'static str {
    let all_solid_state = !devices.is_empty()
        && devices.iter().all(|device| {
            probe_transport(device.as_ref(), sysfs_root) == Some(Transport::SolidState)
        });

    if all_solid_state {
        options_for(Transport::SolidState)
    } else {
        options_for(Transport::Rotational)
    }
}

/// Read `queue/rotational` for a device or, for a partition, its parent disk.
pub fn probe_transport(device: &str, sysfs_root: &Path) -> Option<Transport> {
    let name = device.strip_prefix("/dev/").unwrap_or(device);
    if name.contains('/') {
        // mapper and by-id paths carry no queue of their own
        return None;
    }

    let candidates = [name.to_string(), parent_disk(name)];
    for candidate in candidates.iter() {
        let path = sysfs_root
            .join("block")
            .join(candidate)
            .join("queue/rotational");
        if let Ok(raw) = fs::read_to_string(&path) {
            debug!("{} reports rotational={}", candidate, raw.trim());
            return match raw.trim() {
                "0" => Some(Transport::SolidState),
                "1" => Some(Transport::Rotational),
                _ => None,
            };
        }
    }

    None
}

/// `sda1` -> `sda`, `nvme0n1p2` -> `nvme0n1`, `mmcblk0p1` -> `mmcblk0`.
fn parent_disk(name: &str) -> String {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() {
        return name.to_string();
    }

    if let Some(stem) = trimmed.strip_suffix('p')
        && stem.ends_with(|c: char| c.is_ascii_digit())
    {
        return stem.to_string();
    }

    if trimmed.ends_with(|c: char| c.is_ascii_alphabetic()) && !name.starts_with("nvme") {
        return trimmed.to_string();
    }

    name.to_string()
}
