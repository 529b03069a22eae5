// SPDX-License-Identifier: GPL-3.0-only

use storage_sys::command;
use storage_types::{
    DeviceChange, EncryptionSpec, LuksMapping, Plan, PlanStep, PoolTopology, RaidProfile,
    ResourceRef, StepAction,
};

use super::{
    crypttab_ensure_step, exec_step, keyfile_step, luks_close_steps, luks_steps, probe_steps,
    validate_devices, validate_keyfile,
};
use crate::error::{Result, ServiceError};

/// A pool member named by a request, resolved against the current topology.
struct Member {
    /// Device btrfs knows the member as (mapper path for encrypted members).
    target: String,
    mapping: Option<LuksMapping>,
}

fn resolve_member(topology: &PoolTopology, device: &str) -> Option<Member> {
    if let Some(mapping) = topology
        .mappings
        .iter()
        .find(|m| m.device == device || m.mapper_path() == device)
    {
        return Some(Member {
            target: mapping.mapper_path(),
            mapping: Some(mapping.clone()),
        });
    }

    topology
        .devices
        .iter()
        .find(|member| member.as_str() == device)
        .map(|member| Member {
            target: member.clone(),
            mapping: None,
        })
}

fn ensure_not_member(topology: &PoolTopology, devices: &[String]) -> Result<()> {
    for device in devices {
        if resolve_member(topology, device).is_some() {
            return Err(ServiceError::validation(
                "device_in_use",
                format!("{device} already belongs to {}", topology.mount),
            ));
        }
    }
    Ok(())
}

/// Optional LUKS preparation for devices joining a pool.
fn prepare_new_devices(
    devices: &[String],
    encryption: Option<&EncryptionSpec>,
    steps: &mut Vec<PlanStep>,
) -> Result<(Vec<String>, Vec<LuksMapping>, Option<String>)> {
    steps.extend(probe_steps(devices));

    match encryption.filter(|enc| enc.enabled) {
        Some(encryption) => {
            validate_keyfile(&encryption.keyfile)?;
            steps.push(keyfile_step(&encryption.keyfile));
            let (luks, mappings) = luks_steps(devices, &encryption.keyfile);
            steps.extend(luks);
            let targets = mappings.iter().map(LuksMapping::mapper_path).collect();
            Ok((targets, mappings, Some(encryption.keyfile.clone())))
        }
        None => Ok((devices.to_vec(), Vec::new(), None)),
    }
}

fn balance_step(id: &str, description: String, mount: &str, args: Vec<String>) -> PlanStep {
    let mut argv = command::argv(&["btrfs", "balance", "start", "--bg"]);
    argv.extend(args);
    argv.push(mount.to_string());
    exec_step(
        id,
        description,
        StepAction::Balance,
        argv,
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    )
}

/// Plan a device add, remove or replace against an existing pool.
pub fn plan_change(topology: &PoolTopology, change: &DeviceChange) -> Result<Plan> {
    match change {
        DeviceChange::Add {
            devices,
            encryption,
        } => plan_add(topology, devices, encryption.as_ref()),
        DeviceChange::Remove { devices } => plan_remove(topology, devices),
        DeviceChange::Replace {
            old,
            new,
            encryption,
        } => plan_replace(topology, old, new, encryption.as_ref()),
    }
}

fn plan_add(
    topology: &PoolTopology,
    devices: &[String],
    encryption: Option<&EncryptionSpec>,
) -> Result<Plan> {
    validate_devices(devices)?;
    ensure_not_member(topology, devices)?;

    let mount = topology.mount.as_str();
    let mut steps = Vec::new();
    let (targets, mappings, keyfile) = prepare_new_devices(devices, encryption, &mut steps)?;

    let mut add = command::argv(&["btrfs", "device", "add", "-f"]);
    add.extend(targets.iter().cloned());
    add.push(mount.to_string());
    steps.push(exec_step(
        "device-add",
        format!("Add {} to {mount}", targets.join(", ")),
        StepAction::DeviceAdd,
        add,
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    ));

    let new_count = topology.devices.len() + targets.len();
    let mut convert = Vec::new();
    if new_count >= 2 {
        if topology.data_profile == RaidProfile::Single {
            convert.push("-dconvert=raid1".to_string());
        }
        if topology.metadata_profile == RaidProfile::Single {
            convert.push("-mconvert=raid1".to_string());
        }
    }

    let mut warnings = Vec::new();
    let requires_balance = !convert.is_empty();
    if requires_balance {
        steps.push(balance_step(
            "balance-convert",
            format!("Convert single profiles on {mount} to raid1"),
            mount,
            convert,
        ));
    } else {
        warnings.push(format!(
            "existing data on {mount} is not redistributed onto the new devices until a balance runs"
        ));
    }

    if let Some(keyfile) = &keyfile {
        for mapping in &mappings {
            steps.push(crypttab_ensure_step(mapping, keyfile));
        }
    }

    Ok(Plan {
        steps,
        warnings,
        requires_balance,
        crypttab_lines: keyfile
            .map(|keyfile| {
                mappings
                    .iter()
                    .map(|m| storage_sys::fstab::crypttab_line(&m.name, &keyfile))
                    .collect()
            })
            .unwrap_or_default(),
        ..Plan::default()
    })
}

fn plan_remove(topology: &PoolTopology, devices: &[String]) -> Result<Plan> {
    validate_devices(devices)?;

    let mut members: Vec<Member> = Vec::new();
    for device in devices {
        let member = resolve_member(topology, device).ok_or_else(|| {
            ServiceError::validation(
                "invalid_spec",
                format!("{device} is not a member of {}", topology.mount),
            )
        })?;
        // raw and mapper paths of one encrypted member resolve to the same target
        if !members.iter().any(|m| m.target == member.target) {
            members.push(member);
        }
    }

    let remaining = topology.devices.len().saturating_sub(members.len());
    if remaining == 0 {
        return Err(ServiceError::validation(
            "raid_device_count",
            format!("removing {} would leave {} empty", devices.join(", "), topology.mount),
        ));
    }

    let mount = topology.mount.as_str();
    let mut steps = Vec::new();
    let mut warnings = Vec::new();

    let fallback = RaidProfile::default_for(remaining);
    let mut convert = Vec::new();
    if remaining < topology.data_profile.min_devices() {
        convert.push(format!("-dconvert={fallback}"));
    }
    if remaining < topology.metadata_profile.min_devices() {
        convert.push(format!("-mconvert={fallback}"));
    }
    let requires_balance = !convert.is_empty();
    if requires_balance {
        warnings.push(format!(
            "{mount} drops to {remaining} device(s); profiles are converted to {fallback} first"
        ));
        let mut args = vec!["-f".to_string()];
        args.extend(convert);
        steps.push(balance_step(
            "balance-convert",
            format!("Convert {mount} to {fallback} before removal"),
            mount,
            args,
        ));
    }

    let targets: Vec<String> = members.iter().map(|m| m.target.clone()).collect();
    let mut remove = command::argv(&["btrfs", "device", "remove"]);
    remove.extend(targets.iter().cloned());
    remove.push(mount.to_string());
    steps.push(exec_step(
        "device-remove",
        format!("Remove {} from {mount}", targets.join(", ")),
        StepAction::DeviceRemove,
        remove,
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    ));

    for mapping in members.iter().filter_map(|m| m.mapping.as_ref()) {
        steps.extend(luks_close_steps(mapping));
    }

    Ok(Plan {
        steps,
        warnings,
        requires_balance,
        ..Plan::default()
    })
}

fn plan_replace(
    topology: &PoolTopology,
    old: &str,
    new: &str,
    encryption: Option<&EncryptionSpec>,
) -> Result<Plan> {
    let new_devices = vec![new.to_string()];
    validate_devices(&new_devices)?;
    ensure_not_member(topology, &new_devices)?;

    let member = resolve_member(topology, old).ok_or_else(|| {
        ServiceError::validation(
            "invalid_spec",
            format!("{old} is not a member of {}", topology.mount),
        )
    })?;

    let mount = topology.mount.as_str();
    let mut steps = Vec::new();
    let (targets, mappings, keyfile) = prepare_new_devices(&new_devices, encryption, &mut steps)?;
    let new_target = targets.first().cloned().unwrap_or_else(|| new.to_string());

    steps.push(exec_step(
        "replace-start",
        format!("Replace {} with {new_target} on {mount}", member.target),
        StepAction::Replace,
        command::argv(&[
            "btrfs",
            "replace",
            "start",
            "-f",
            &member.target,
            &new_target,
            mount,
        ]),
        Some(ResourceRef::Mount {
            path: mount.to_string(),
        }),
    ));

    if let Some(mapping) = &member.mapping {
        steps.extend(luks_close_steps(mapping));
    }
    if let Some(keyfile) = &keyfile {
        for mapping in &mappings {
            steps.push(crypttab_ensure_step(mapping, keyfile));
        }
    }

    Ok(Plan {
        steps,
        ..Plan::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::ConfirmVerb;

    fn topology(devices: &[&str], data: RaidProfile, metadata: RaidProfile) -> PoolTopology {
        PoolTopology {
            mount: "/mnt/tank".to_string(),
            devices: devices.iter().map(ToString::to_string).collect(),
            data_profile: data,
            metadata_profile: metadata,
            mappings: Vec::new(),
        }
    }

    fn add(devices: &[&str]) -> DeviceChange {
        DeviceChange::Add {
            devices: devices.iter().map(ToString::to_string).collect(),
            encryption: None,
        }
    }

    #[test]
    fn adding_to_single_device_pool_converts_to_raid1() {
        let pool = topology(&["/dev/sdb"], RaidProfile::Single, RaidProfile::Single);
        let plan = plan_change(&pool, &add(&["/dev/sdc"])).expect("plan");

        assert!(plan.requires_balance);
        assert_eq!(plan.confirm_verb(), Some(ConfirmVerb::Add));
        let balance = plan.steps.last().expect("balance step");
        assert_eq!(balance.action, StepAction::Balance);
        assert_eq!(
            balance.command,
            "btrfs balance start --bg -dconvert=raid1 -mconvert=raid1 /mnt/tank"
        );
    }

    #[test]
    fn adding_to_raid1_pool_only_warns() {
        let pool = topology(
            &["/dev/sdb", "/dev/sdc"],
            RaidProfile::Raid1,
            RaidProfile::Raid1,
        );
        let plan = plan_change(&pool, &add(&["/dev/sdd"])).expect("plan");

        assert!(!plan.requires_balance);
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(
            plan.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["probe-sdd", "device-add"]
        );
    }

    #[test]
    fn adding_existing_member_is_rejected() {
        let pool = topology(&["/dev/sdb"], RaidProfile::Single, RaidProfile::Single);
        let err = plan_change(&pool, &add(&["/dev/sdb"])).expect_err("member");
        assert_eq!(err.code(), "device_in_use");
    }

    #[test]
    fn encrypted_add_targets_mapper_and_persists_crypttab() {
        let pool = topology(
            &["/dev/sdb", "/dev/sdc"],
            RaidProfile::Raid1,
            RaidProfile::Raid1,
        );
        let change = DeviceChange::Add {
            devices: vec!["/dev/sdd".to_string()],
            encryption: Some(EncryptionSpec {
                enabled: true,
                keyfile: "/etc/nasos/keys/tank.key".to_string(),
            }),
        };
        let plan = plan_change(&pool, &change).expect("plan");

        let add = plan.steps.iter().find(|s| s.id == "device-add").expect("add");
        assert!(add.command.contains("/dev/mapper/crypt-sdd"));
        assert!(plan.steps.iter().any(|s| s.id == "crypttab-crypt-sdd"));
        assert_eq!(plan.crypttab_lines.len(), 1);
    }

    #[test]
    fn removal_below_profile_minimum_converts_first() {
        let pool = topology(
            &["/dev/sdb", "/dev/sdc"],
            RaidProfile::Raid1,
            RaidProfile::Raid1,
        );
        let plan = plan_change(
            &pool,
            &DeviceChange::Remove {
                devices: vec!["/dev/sdc".to_string()],
            },
        )
        .expect("plan");

        assert!(plan.requires_balance);
        assert_eq!(plan.steps[0].id, "balance-convert");
        assert!(
            plan.steps[0]
                .command
                .contains("-f -dconvert=single -mconvert=single")
        );
        assert_eq!(plan.steps[1].command, "btrfs device remove /dev/sdc /mnt/tank");
        assert_eq!(plan.confirm_verb(), Some(ConfirmVerb::Remove));
    }

    #[test]
    fn removing_last_device_is_rejected() {
        let pool = topology(&["/dev/sdb"], RaidProfile::Single, RaidProfile::Single);
        let err = plan_change(
            &pool,
            &DeviceChange::Remove {
                devices: vec!["/dev/sdb".to_string()],
            },
        )
        .expect_err("empty pool");
        assert_eq!(err.code(), "raid_device_count");
    }

    fn encrypted_pool() -> PoolTopology {
        let mut pool = topology(
            &[
                "/dev/mapper/crypt-sdb",
                "/dev/mapper/crypt-sdc",
                "/dev/mapper/crypt-sdd",
            ],
            RaidProfile::Raid1,
            RaidProfile::Raid1,
        );
        pool.mappings = ["sdb", "sdc", "sdd"]
            .iter()
            .map(|dev| LuksMapping {
                name: format!("crypt-{dev}"),
                device: format!("/dev/{dev}"),
            })
            .collect();
        pool
    }

    #[test]
    fn removing_encrypted_member_closes_its_mapping() {
        let pool = encrypted_pool();
        let plan = plan_change(
            &pool,
            &DeviceChange::Remove {
                devices: vec!["/dev/sdd".to_string()],
            },
        )
        .expect("plan");

        assert!(!plan.requires_balance);
        assert_eq!(
            plan.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec![
                "device-remove",
                "luks-close-crypt-sdd",
                "crypttab-remove-crypt-sdd"
            ]
        );
        assert!(plan.steps[0].command.contains("/dev/mapper/crypt-sdd"));
    }

    #[test]
    fn raw_and_mapper_names_of_one_member_count_once() {
        let plan = plan_change(
            &encrypted_pool(),
            &DeviceChange::Remove {
                devices: vec!["/dev/sdd".to_string(), "/dev/mapper/crypt-sdd".to_string()],
            },
        )
        .expect("plan");

        assert!(!plan.requires_balance);
        assert!(plan.warnings.is_empty());
        assert_eq!(
            plan.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec![
                "device-remove",
                "luks-close-crypt-sdd",
                "crypttab-remove-crypt-sdd"
            ]
        );
        assert_eq!(
            plan.steps[0].command,
            "btrfs device remove /dev/mapper/crypt-sdd /mnt/tank"
        );
    }

    #[test]
    fn replace_starts_long_running_operation() {
        let pool = topology(
            &["/dev/sdb", "/dev/sdc"],
            RaidProfile::Raid1,
            RaidProfile::Raid1,
        );
        let plan = plan_change(
            &pool,
            &DeviceChange::Replace {
                old: "/dev/sdc".to_string(),
                new: "/dev/sdd".to_string(),
                encryption: None,
            },
        )
        .expect("plan");

        let replace = plan.steps.last().expect("replace");
        assert!(replace.action.is_long_running());
        assert!(replace.destructive);
        assert_eq!(
            replace.command,
            "btrfs replace start -f /dev/sdc /dev/sdd /mnt/tank"
        );
        assert_eq!(plan.confirm_verb(), Some(ConfirmVerb::Replace));
    }

    #[test]
    fn replace_rejects_unknown_old_device() {
        let pool = topology(&["/dev/sdb"], RaidProfile::Single, RaidProfile::Single);
        let err = plan_change(
            &pool,
            &DeviceChange::Replace {
                old: "/dev/sdx".to_string(),
                new: "/dev/sdd".to_string(),
                encryption: None,
            },
        )
        .expect_err("unknown member");
        assert_eq!(err.code(), "invalid_spec");
    }
}
