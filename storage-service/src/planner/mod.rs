// SPDX-License-Identifier: GPL-3.0-only

//! Deterministic step planning for pool operations.
//!
//! Planners are pure: the same request always yields the same steps. Anything
//! that needs the agent (signature probes, profile discovery, the destroy
//! cleanliness check) happens in the engine before or after planning.

mod create;
mod destroy;
mod topology;

use std::collections::HashSet;
use std::path::Path;

use storage_sys::command;
use storage_sys::fstab;
use storage_types::{LuksMapping, Plan, PlanStep, PoolSpec, ResourceRef, StepAction};

use crate::error::{Result, ServiceError};

pub use create::plan_create;
pub use destroy::plan_destroy;
pub use topology::plan_change;

pub(crate) fn exec_step(
    id: impl Into<String>,
    description: impl Into<String>,
    action: StepAction,
    argv: Vec<String>,
    resource: Option<ResourceRef>,
) -> PlanStep {
    PlanStep {
        id: id.into(),
        description: description.into(),
        command: command::render(&argv),
        argv,
        destructive: action.is_destructive(),
        action,
        resource,
    }
}

/// A step carried out through the agent's fstab/crypttab calls.
pub(crate) fn table_step(
    id: impl Into<String>,
    description: impl Into<String>,
    action: StepAction,
    needle: String,
    line: Option<String>,
    uuid_of: Option<String>,
) -> PlanStep {
    let table = match action {
        StepAction::CrypttabEnsure | StepAction::CrypttabRemove => "/etc/crypttab",
        _ => "/etc/fstab",
    };
    let command = match &line {
        Some(line) => format!("ensure line in {table}: {line}"),
        None => format!("remove lines containing '{needle}' from {table}"),
    };

    PlanStep {
        id: id.into(),
        description: description.into(),
        command,
        argv: Vec::new(),
        destructive: action.is_destructive(),
        action,
        resource: Some(ResourceRef::TableEntry {
            needle,
            line,
            uuid_of,
        }),
    }
}

/// `/dev/disk/by-id/ata-X` -> `disk-by-id-ata-X`.
pub fn device_slug(device: &str) -> String {
    device
        .strip_prefix("/dev/")
        .unwrap_or(device)
        .replace('/', "-")
}

/// Name of the `/dev/mapper` entry opened over a raw device.
pub fn mapping_name(device: &str) -> String {
    format!("crypt-{}", device_slug(device))
}

pub(crate) fn probe_steps(devices: &[String]) -> Vec<PlanStep> {
    devices
        .iter()
        .map(|device| {
            exec_step(
                format!("probe-{}", device_slug(device)),
                format!("Probe {device} for existing signatures"),
                StepAction::Probe,
                storage_sys::probe::wipefs_probe_argv(device),
                Some(ResourceRef::Device {
                    path: device.clone(),
                }),
            )
        })
        .collect()
}

pub(crate) fn keyfile_step(keyfile: &str) -> PlanStep {
    let dir = Path::new(keyfile)
        .parent()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    let script = format!(
        "test -s {key} || (umask 077 && mkdir -p {dir} && head -c 64 /dev/urandom > {key})",
        key = command::quote(keyfile),
        dir = command::quote(&dir),
    );

    exec_step(
        "keyfile",
        format!("Ensure keyfile {keyfile} exists"),
        StepAction::EnsureKeyfile,
        command::argv(&["sh", "-c", &script]),
        None,
    )
}

/// Format and open every device; returns the steps and the mappings they create.
pub(crate) fn luks_steps(devices: &[String], keyfile: &str) -> (Vec<PlanStep>, Vec<LuksMapping>) {
    let mut steps = Vec::new();
    let mut mappings = Vec::new();

    for device in devices {
        let slug = device_slug(device);
        let name = mapping_name(device);

        steps.push(exec_step(
            format!("luks-format-{slug}"),
            format!("Format {device} as LUKS2"),
            StepAction::LuksFormat,
            command::argv(&[
                "cryptsetup",
                "luksFormat",
                "--batch-mode",
                "--type",
                "luks2",
                "--key-file",
                keyfile,
                device,
            ]),
            Some(ResourceRef::Device {
                path: device.clone(),
            }),
        ));
        steps.push(exec_step(
            format!("luks-open-{slug}"),
            format!("Open {device} as /dev/mapper/{name}"),
            StepAction::LuksOpen,
            command::argv(&["cryptsetup", "open", "--key-file", keyfile, device, &name]),
            Some(ResourceRef::Mapping {
                name: name.clone(),
                device: device.clone(),
            }),
        ));

        mappings.push(LuksMapping {
            name,
            device: device.clone(),
        });
    }

    (steps, mappings)
}

pub(crate) fn crypttab_ensure_step(mapping: &LuksMapping, keyfile: &str) -> PlanStep {
    table_step(
        format!("crypttab-{}", mapping.name),
        format!("Persist crypttab entry for {}", mapping.name),
        StepAction::CrypttabEnsure,
        fstab::mapping_needle(&mapping.name),
        Some(fstab::crypttab_line(&mapping.name, keyfile)),
        Some(mapping.device.clone()),
    )
}

pub(crate) fn luks_close_steps(mapping: &LuksMapping) -> [PlanStep; 2] {
    [
        exec_step(
            format!("luks-close-{}", mapping.name),
            format!("Close /dev/mapper/{}", mapping.name),
            StepAction::LuksClose,
            command::argv(&["cryptsetup", "close", &mapping.name]),
            Some(ResourceRef::Mapping {
                name: mapping.name.clone(),
                device: mapping.device.clone(),
            }),
        ),
        table_step(
            format!("crypttab-remove-{}", mapping.name),
            format!("Remove crypttab entry for {}", mapping.name),
            StepAction::CrypttabRemove,
            fstab::mapping_needle(&mapping.name),
            None,
            None,
        ),
    ]
}

/// Shape checks shared by every request naming devices.
pub fn validate_devices(devices: &[String]) -> Result<()> {
    if devices.is_empty() {
        return Err(ServiceError::validation(
            "invalid_spec",
            "at least one device is required",
        ));
    }

    let mut seen = HashSet::new();
    for device in devices {
        if !device.starts_with("/dev/") || device.len() <= "/dev/".len() {
            return Err(ServiceError::validation(
                "invalid_spec",
                format!("device must be a /dev path: {device}"),
            ));
        }
        if device.chars().any(char::is_whitespace) {
            return Err(ServiceError::validation(
                "invalid_spec",
                format!("device path contains whitespace: {device}"),
            ));
        }
        if !seen.insert(device.as_str()) {
            return Err(ServiceError::validation(
                "invalid_spec",
                format!("device listed twice: {device}"),
            ));
        }
    }

    Ok(())
}

/// Lexical canonical form of a mountpoint: trailing and repeated `/`
/// dropped. `.` and `..` components are rejected rather than resolved.
pub fn normalize_mountpoint(mountpoint: &str) -> Result<String> {
    let invalid = |reason: &str| {
        ServiceError::validation(
            "invalid_spec",
            format!("mountpoint {reason}: {mountpoint:?}"),
        )
    };

    if !mountpoint.starts_with('/') || mountpoint.chars().any(char::is_whitespace) {
        return Err(invalid("must be an absolute path without whitespace"));
    }
    let components: Vec<&str> = mountpoint.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(invalid("must not contain . or .. components"));
    }
    if components.is_empty() {
        return Err(invalid("must not be /"));
    }

    Ok(format!("/{}", components.join("/")))
}

pub(crate) fn validate_keyfile(keyfile: &str) -> Result<()> {
    if !keyfile.starts_with('/') || keyfile.ends_with('/') || keyfile.chars().any(char::is_whitespace)
    {
        return Err(ServiceError::validation(
            "invalid_spec",
            format!("keyfile must be an absolute file path: {keyfile:?}"),
        ));
    }
    Ok(())
}

/// Reject malformed or inconsistent pool specs before any planning.
pub fn validate_spec(spec: &PoolSpec) -> Result<()> {
    let name_ok = !spec.name.is_empty()
        && spec
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !name_ok {
        return Err(ServiceError::validation(
            "invalid_spec",
            format!("pool name must be non-empty [A-Za-z0-9_-]: {:?}", spec.name),
        ));
    }

    validate_devices(&spec.devices)?;
    normalize_mountpoint(&spec.mountpoint)?;

    for (role, profile) in [
        ("data", spec.data_profile()),
        ("metadata", spec.metadata_profile()),
    ] {
        if profile.is_forbidden() {
            return Err(ServiceError::validation(
                "forbidden_raid_profile",
                format!("{role} profile {profile} is not supported"),
            ));
        }
        if spec.devices.len() < profile.min_devices() {
            return Err(ServiceError::validation(
                "raid_device_count",
                format!(
                    "{role} profile {profile} needs at least {} devices, got {}",
                    profile.min_devices(),
                    spec.devices.len()
                ),
            ));
        }
    }

    if let Some(encryption) = spec.encryption.as_ref().filter(|enc| enc.enabled) {
        validate_keyfile(&encryption.keyfile)?;
    }

    Ok(())
}

/// The confirmation string must equal the plan's inferred verb.
pub fn check_confirmation(plan: &Plan, confirm: &str) -> Result<()> {
    match plan.confirm_verb() {
        Some(verb) if verb.as_str() == confirm => Ok(()),
        Some(verb) => Err(ServiceError::validation(
            "confirmation_mismatch",
            format!("confirmation must be {verb}, got {confirm:?}"),
        )),
        None => Ok(()),
    }
}
