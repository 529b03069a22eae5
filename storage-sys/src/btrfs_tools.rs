// SPDX-License-Identifier: GPL-3.0-only

//! Parsers for btrfs-progs text output.
//!
//! The output format is not a stable interface, so every parser here is
//! tolerant: unknown lines are skipped and missing data falls back to a
//! documented default.

use storage_types::RaidProfile;
use tracing::debug;

/// Profile assumed when usage output cannot be read.
pub const FALLBACK_PROFILE: RaidProfile = RaidProfile::Raid1;

/// Member device paths from `btrfs filesystem show --raw <mount>`.
///
/// Only `devid <n> ... path <device>` lines count; everything else
/// (label, totals, missing-device notices) is skipped.
pub fn member_devices(output: &str) -> Vec<String> {
    let mut members: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim) {
        if !line.starts_with("devid ") {
            continue;
        }
        let Some(path) = line.rsplit_once(" path ").map(|(_, path)| path.trim()) else {
            continue;
        };
        if path.starts_with('/') && !members.iter().any(|m| m == path) {
            members.push(path.to_string());
        }
    }
    members
}

/// Data and metadata profiles from `btrfs filesystem df`/`usage` output.
///
/// Looks for lines starting with `data,` / `metadata,` (case-insensitive),
/// e.g. `Data, RAID1: total=...` or `Metadata,single: Size:...`. Either
/// profile that cannot be read falls back to [`FALLBACK_PROFILE`].
pub fn parse_profiles(output: &str) -> (RaidProfile, RaidProfile) {
    let mut data = None;
    let mut metadata = None;

    for line in output.lines() {
        let lower = line.trim().to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("data,") {
            data = data.or_else(|| profile_before_colon(rest));
        } else if let Some(rest) = lower.strip_prefix("metadata,") {
            metadata = metadata.or_else(|| profile_before_colon(rest));
        }
    }

    if data.is_none() || metadata.is_none() {
        debug!(
            "Profile lines missing from usage output, assuming {}",
            FALLBACK_PROFILE
        );
    }

    (
        data.unwrap_or(FALLBACK_PROFILE),
        metadata.unwrap_or(FALLBACK_PROFILE),
    )
}

fn profile_before_colon(rest: &str) -> Option<RaidProfile> {
    rest.split(':').next()?.trim().parse().ok()
}
