// SPDX-License-Identifier: GPL-3.0-only

/// Render an argv for display, single-quoting arguments the shell would split.
pub fn render<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-quote an argument when the shell would otherwise split or expand it.
pub fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));

    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Build an owned argv from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_context() {
        let rendered = render(&["mkfs.btrfs", "-f", "-d", "raid1", "/dev/sdb", "/dev/sdc"]);
        assert_eq!(rendered, "mkfs.btrfs -f -d raid1 /dev/sdb /dev/sdc");
    }

    #[test]
    fn quotes_shell_fragments() {
        let rendered = render(&["sh", "-c", "mount UUID=$(blkid -s UUID -o value /dev/sdb) /mnt/x"]);
        assert_eq!(
            rendered,
            "sh -c 'mount UUID=$(blkid -s UUID -o value /dev/sdb) /mnt/x'"
        );
        assert_eq!(render(&["echo", "it's"]), r"echo 'it'\''s'");
        assert_eq!(render(&["echo", ""]), "echo ''");
    }
}
