// SPDX-License-Identifier: GPL-3.0-only

//! Cleanliness check run before a pool is destroyed.

use storage_types::RESERVED_SUBVOLUMES;

/// Entries of a directory listing (`ls -A` output, one per line) that are
/// neither dotfiles nor reserved subvolumes.
pub fn unexpected_entries(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter(|entry| !entry.starts_with('.'))
        .filter(|entry| !RESERVED_SUBVOLUMES.contains(entry))
        .map(ToString::to_string)
        .collect()
}
