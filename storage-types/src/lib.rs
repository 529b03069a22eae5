// SPDX-License-Identifier: GPL-3.0-only

//! Shared domain models for NAS pool management
//!
//! This crate defines the types that travel between the pool service, its
//! clients and its on-disk state:
//!
//! - **Pool requests**: `PoolSpec`, `DeviceChange`, `PoolTopology`
//! - **Plans**: ordered `PlanStep`s tagged with a `StepAction` and `ResourceRef`
//! - **Transactions**: the durable `Tx` record and its `TxStep`s
//! - **Pool records**: `PoolOptionsRecord`, the persisted mount options and members

pub mod options;
pub mod plan;
pub mod pool;
pub mod tx;

pub use options::{CONSERVATIVE_OPTIONS, LuksMapping, OptionsChange, PoolOptionsRecord};
pub use plan::{
    ConfirmVerb, Plan, PlanStep, RESERVED_SUBVOLUMES, ResourceRef, StepAction, UUID_TOKEN,
};
pub use pool::{DeviceChange, EncryptionSpec, PoolSpec, PoolTopology, RaidProfile};
pub use tx::{LogLevel, StepStatus, Tx, TxKind, TxStep};
