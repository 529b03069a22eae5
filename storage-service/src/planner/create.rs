// SPDX-License-Identifier: GPL-3.0-only

use storage_sys::{command, fstab, validate_mount_options};
use storage_types::{Plan, PoolSpec, RESERVED_SUBVOLUMES, ResourceRef, StepAction};

use super::{
    crypttab_ensure_step, exec_step, keyfile_step, luks_steps, probe_steps, table_step,
    validate_spec,
};
use crate::error::Result;

/// Plan a new pool.
///
/// `default_options` is used when the spec carries no explicit mount options;
/// the engine computes it from device transport.
pub fn plan_create(spec: &PoolSpec, default_options: &str) -> Result<Plan> {
    validate_spec(spec)?;

    let options = match &spec.mount_options {
        Some(explicit) => validate_mount_options(explicit)?,
        None => validate_mount_options(default_options)?,
    };
    let mount = spec.mountpoint.as_str();

    let mut steps = probe_steps(&spec.devices);

    let (targets, mappings, keyfile) = match spec.encryption.as_ref().filter(|enc| enc.enabled) {
        Some(encryption) => {
            steps.push(keyfile_step(&encryption.keyfile));
            let (luks, mappings) = luks_steps(&spec.devices, &encryption.keyfile);
            steps.extend(luks);
            let targets: Vec<String> = mappings.iter().map(|m| m.mapper_path()).collect();
            (targets, mappings, Some(encryption.keyfile.as_str()))
        }
        None => (spec.devices.clone(), Vec::new(), None),
    };

    let data = spec.data_profile();
    let metadata = spec.metadata_profile();
    let mut mkfs = command::argv(&[
        "mkfs.btrfs",
        "-f",
        "-L",
        &spec.name,
        "-d",
        data.as_str(),
        "-m",
        metadata.as_str(),
    ]);
    mkfs.extend(targets.iter().cloned());
    steps.push(exec_step(
        "mkfs",
        format!("Create btrfs ({data}/{metadata}) on {}", targets.join(", ")),
        StepAction::Mkfs,
        mkfs,
        None,
    ));

    steps.push(exec_step(
        "mkdir",
        format!("Create mountpoint {mount}"),
        StepAction::Mkdir,
        command::argv(&["mkdir", "-p", mount]),
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    ));

    let first_target = targets.first().cloned().unwrap_or_default();
    let mount_argv = if mappings.is_empty() {
        let script = format!(
            "mount -o {} UUID=$(blkid -s UUID -o value {}) {}",
            command::quote(&options),
            command::quote(&first_target),
            command::quote(mount),
        );
        command::argv(&["sh", "-c", &script])
    } else {
        command::argv(&["mount", "-o", &options, &first_target, mount])
    };
    steps.push(exec_step(
        "mount",
        format!("Mount pool at {mount}"),
        StepAction::Mount,
        mount_argv,
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    ));

    for name in RESERVED_SUBVOLUMES {
        let path = format!("{mount}/{name}");
        steps.push(exec_step(
            format!("subvol-{name}"),
            format!("Create subvolume {path}"),
            StepAction::SubvolumeCreate,
            command::argv(&["btrfs", "subvolume", "create", &path]),
            None,
        ));
    }

    let mut crypttab_lines = Vec::new();
    if let Some(keyfile) = keyfile {
        for mapping in &mappings {
            crypttab_lines.push(fstab::crypttab_line(&mapping.name, keyfile));
            steps.push(crypttab_ensure_step(mapping, keyfile));
        }
    }

    let fstab_line = fstab::fstab_line(mount, &options);
    steps.push(table_step(
        "fstab",
        format!("Persist fstab entry for {mount}"),
        StepAction::FstabEnsure,
        fstab::mount_needle(mount),
        Some(fstab_line.clone()),
        Some(first_target),
    ));

    Ok(Plan {
        steps,
        warnings: Vec::new(),
        requires_balance: false,
        mount_options: options,
        fstab_lines: vec![fstab_line],
        crypttab_lines,
    })
}
