// SPDX-License-Identifier: GPL-3.0-only

//! Non-destructive signature probe run before a device is formatted.

/// `wipefs` in no-act mode, one signature type per output line.
pub fn wipefs_probe_argv(device: &str) -> Vec<String> {
    ["wipefs", "-n", "--noheadings", "--output", "TYPE", device]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Signature types listed by [`wipefs_probe_argv`].
pub fn parse_signatures(stdout: &str) -> Vec<String> {
    let mut signatures: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();
    signatures.dedup();
    signatures
}
