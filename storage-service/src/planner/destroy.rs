// SPDX-License-Identifier: GPL-3.0-only

use storage_sys::{command, fstab};
use storage_types::{Plan, PoolOptionsRecord, ResourceRef, StepAction};

use super::{device_slug, exec_step, luks_close_steps, table_step};

/// Plan the teardown of a recorded pool.
///
/// The cleanliness check on the mountpoint is the caller's job; this only
/// orders the steps.
pub fn plan_destroy(record: &PoolOptionsRecord, wipe: bool) -> Plan {
    let mount = record.mount.as_str();
    let mut steps = vec![
        exec_step(
            "unmount",
            format!("Unmount {mount}"),
            StepAction::Unmount,
            command::argv(&["umount", mount]),
            Some(ResourceRef::Mount {
                path: mount.to_string(),
            }),
        ),
        table_step(
            "fstab-remove",
            format!("Remove fstab entry for {mount}"),
            StepAction::FstabRemove,
            fstab::mount_needle(mount),
            None,
            None,
        ),
    ];

    for mapping in &record.mappings {
        steps.extend(luks_close_steps(mapping));
    }

    let mut warnings = Vec::new();
    if wipe {
        for device in raw_devices(record) {
            steps.push(exec_step(
                format!("wipe-{}", device_slug(&device)),
                format!("Erase signatures on {device}"),
                StepAction::Wipe,
                command::argv(&["wipefs", "-a", &device]),
                Some(ResourceRef::Device {
                    path: device.clone(),
                }),
            ));
        }
        warnings.push(format!("all data on the devices behind {mount} is erased"));
    }

    Plan {
        steps,
        warnings,
        mount_options: record.mount_options.clone(),
        ..Plan::default()
    }
}

/// Devices under the pool with LUKS mappings resolved to their raw device.
fn raw_devices(record: &PoolOptionsRecord) -> Vec<String> {
    record
        .devices
        .iter()
        .map(|device| {
            record
                .mappings
                .iter()
                .find(|m| m.mapper_path() == *device)
                .map(|m| m.device.clone())
                .unwrap_or_else(|| device.clone())
        })
        .collect()
}
