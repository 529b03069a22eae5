// SPDX-License-Identifier: GPL-3.0-only

//! D-Bus client wrappers for the privileged agent

pub mod agent;

pub use agent::AgentClient;
