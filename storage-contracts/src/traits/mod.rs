// SPDX-License-Identifier: GPL-3.0-only

pub mod agent;

pub use agent::AgentOps;
