// SPDX-License-Identifier: GPL-3.0-only

//! Scripted stand-in for the privileged agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use storage_contracts::{
    AgentOps, BalanceStatus, ExecRequest, ExecResponse, ReplaceStatus, StorageError, TableFile,
};
use storage_sys::command;

pub const TEST_UUID: &str = "0f6c3a5e-7d1b-4c2a-9e8f-112233445566";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Execute(ExecRequest),
    BalanceStatus(String),
    ReplaceStatus(String),
    EnsureLine(TableFile, String),
    RemoveLines(TableFile, String),
}

/// Records every call and answers from configured rules.
///
/// `execute` answers with the first rule whose pattern is a substring of the
/// rendered command, else exit 0 (blkid answers with [`TEST_UUID`]).
/// Status queries pop scripted entries and report "finished" once empty.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    calls: Arc<Mutex<Vec<AgentCall>>>,
    rules: Arc<Mutex<Vec<(String, ExecResponse)>>>,
    balance: Arc<Mutex<VecDeque<BalanceStatus>>>,
    replace: Arc<Mutex<VecDeque<ReplaceStatus>>>,
    unreachable: Arc<Mutex<bool>>,
    status_failures: Arc<Mutex<usize>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            ExecResponse {
                exit_code,
                stdout: stdout.to_string(),
            },
        ));
    }

    pub fn fail(&self, pattern: &str) {
        self.respond(pattern, 1, "");
    }

    pub fn script_balance(&self, statuses: Vec<BalanceStatus>) {
        *self.balance.lock().unwrap() = statuses.into();
    }

    pub fn script_replace(&self, statuses: Vec<ReplaceStatus>) {
        *self.replace.lock().unwrap() = statuses.into();
    }

    /// Make the next `count` balance/replace status queries fail.
    pub fn fail_status_queries(&self, count: usize) {
        *self.status_failures.lock().unwrap() = count;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap() = unreachable;
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered commands passed to `execute`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::Execute(request) => {
                    let mut argv = vec![request.command];
                    argv.extend(request.args);
                    Some(command::render(&argv))
                }
                _ => None,
            })
            .collect()
    }

    pub fn balance_polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AgentCall::BalanceStatus(_)))
            .count()
    }

    pub fn replace_polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AgentCall::ReplaceStatus(_)))
            .count()
    }

    pub fn table_calls(&self) -> Vec<AgentCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, AgentCall::EnsureLine(..) | AgentCall::RemoveLines(..)))
            .collect()
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if *self.unreachable.lock().unwrap() {
            Err(StorageError::unavailable("agent socket closed"))
        } else {
            Ok(())
        }
    }

    fn check_status_failure(&self) -> Result<(), StorageError> {
        let mut remaining = self.status_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            Err(StorageError::unavailable("status query timed out"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentOps for ScriptedAgent {
    async fn execute(&self, request: ExecRequest) -> Result<ExecResponse, StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::Execute(request.clone()));
        self.check_reachable()?;

        let mut argv = vec![request.command.clone()];
        argv.extend(request.args.iter().cloned());
        let rendered = command::render(&argv);

        let rules = self.rules.lock().unwrap();
        if let Some((_, response)) = rules.iter().find(|(pattern, _)| rendered.contains(pattern)) {
            return Ok(response.clone());
        }

        let stdout = if request.command == "blkid" {
            format!("{TEST_UUID}\n")
        } else {
            String::new()
        };
        Ok(ExecResponse {
            exit_code: 0,
            stdout,
        })
    }

    async fn balance_status(&self, mount: &str) -> Result<BalanceStatus, StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::BalanceStatus(mount.to_string()));
        self.check_reachable()?;
        self.check_status_failure()?;
        Ok(self
            .balance
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BalanceStatus {
                running: false,
                percent: 100,
                left: None,
                total: None,
            }))
    }

    async fn replace_status(&self, mount: &str) -> Result<ReplaceStatus, StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::ReplaceStatus(mount.to_string()));
        self.check_reachable()?;
        self.check_status_failure()?;
        Ok(self
            .replace
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReplaceStatus {
                running: false,
                percent: 100,
                completed: None,
                total: None,
            }))
    }

    async fn ensure_line(&self, table: TableFile, line: &str) -> Result<(), StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::EnsureLine(table, line.to_string()));
        self.check_reachable()
    }

    async fn remove_lines_containing(
        &self,
        table: TableFile,
        needle: &str,
    ) -> Result<(), StorageError> {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::RemoveLines(table, needle.to_string()));
        self.check_reachable()
    }
}
