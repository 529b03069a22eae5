// SPDX-License-Identifier: GPL-3.0-only

//! Mount-option grammar accepted for pools.

use crate::error::MountOptionError;

const BARE_TOKENS: [&str; 6] = [
    "ssd",
    "noatime",
    "nodiratime",
    "autodefrag",
    "discard",
    "discard=async",
];

const ZSTD_LEVELS: std::ops::RangeInclusive<i64> = 1..=15;

/// Validate a comma-separated option string and return it normalized
/// (tokens trimmed, rejoined with `,`).
pub fn validate(options: &str) -> Result<String, MountOptionError> {
    let options = options.trim();
    if options.is_empty() {
        return Err(MountOptionError::Empty);
    }

    let mut normalized = Vec::new();
    for raw in options.split(',') {
        let token = raw.trim();
        check_token(token)?;
        normalized.push(token);
    }

    Ok(normalized.join(","))
}

fn check_token(token: &str) -> Result<(), MountOptionError> {
    let invalid = || MountOptionError::InvalidToken {
        token: token.to_string(),
    };

    // nodatacow disables checksums
    if token == "nodatacow" {
        return Err(invalid());
    }

    if BARE_TOKENS.contains(&token) {
        return Ok(());
    }

    let Some(value) = token.strip_prefix("compress=") else {
        return Err(invalid());
    };

    let (algorithm, level) = match value.split_once(':') {
        Some((algorithm, level)) => (algorithm, Some(level)),
        None => (value, None),
    };

    if algorithm != "zstd" {
        return Err(invalid());
    }

    if let Some(level) = level {
        let level: i64 = level.parse().map_err(|_| invalid())?;
        if !ZSTD_LEVELS.contains(&level) {
            return Err(invalid());
        }
    }

    Ok(())
}
