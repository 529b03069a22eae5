// SPDX-License-Identifier: GPL-3.0-only

//! fstab/crypttab line construction.

use storage_types::UUID_TOKEN;

/// Proposed fstab line for a pool; the source is resolved at apply time.
pub fn fstab_line(mount: &str, options: &str) -> String {
    format!("UUID={UUID_TOKEN} {mount} btrfs {options} 0 0")
}

/// Proposed crypttab line for one LUKS mapping.
pub fn crypttab_line(mapping: &str, keyfile: &str) -> String {
    format!("{mapping} UUID={UUID_TOKEN} {keyfile} luks,discard")
}

/// Substitute the real UUID into a proposed line.
pub fn resolve_uuid(template: &str, uuid: &str) -> String {
    template.replace(UUID_TOKEN, uuid.trim())
}

/// Substring that identifies the fstab line of a mountpoint without
/// matching longer paths sharing its prefix.
pub fn mount_needle(mount: &str) -> String {
    format!(" {mount} ")
}

/// Substring that identifies the crypttab line of a mapping.
pub fn mapping_needle(mapping: &str) -> String {
    format!("{mapping} ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_placeholder_until_resolved() {
        let line = fstab_line("/mnt/tank", "compress=zstd:3,noatime");
        assert_eq!(
            line,
            "UUID=__UUID__ /mnt/tank btrfs compress=zstd:3,noatime 0 0"
        );
        assert_eq!(
            resolve_uuid(&line, "c0ffee\n"),
            "UUID=c0ffee /mnt/tank btrfs compress=zstd:3,noatime 0 0"
        );
    }

    #[test]
    fn crypttab_line_names_mapping_and_keyfile() {
        assert_eq!(
            crypttab_line("tank-crypt0", "/etc/nasos/keys/tank.key"),
            "tank-crypt0 UUID=__UUID__ /etc/nasos/keys/tank.key luks,discard"
        );
    }

    #[test]
    fn mount_needle_does_not_match_prefix_siblings() {
        let needle = mount_needle("/mnt/tank");
        assert!("UUID=x /mnt/tank btrfs noatime 0 0".contains(&needle));
        assert!(!"UUID=x /mnt/tank2 btrfs noatime 0 0".contains(&needle));
    }
}
