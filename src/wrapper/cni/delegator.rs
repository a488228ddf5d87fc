/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::wrapper::cni::args::{CmdArgs, Command as CniCommand};
use crate::wrapper::cni::types::{CniError, DelegateError, CODE_INTERNAL, CODE_TRY_AGAIN_LATER};
use crate::wrapper::logger::{log_debug, log_warn};
use crate::wrapper::util::error::DynResult;

use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::time;

const COMPONENT: &str = "delegator";

/// Runs the wrapped plugin on the wrapper's behalf.
pub trait Delegator: Send + Sync {
    /// Invokes ADD on `plugin` and returns its result object.
    fn delegate_add(&self, plugin: &str, netconf: &[u8]) -> DynResult<Value>;
    /// Invokes DEL on `plugin`.
    fn delegate_del(&self, plugin: &str, netconf: &[u8]) -> DynResult<()>;
}

/// Executes delegate plugins found on `CNI_PATH`, passing along the CNI
/// environment of the current invocation.
pub struct ExecDelegator {
    args: CmdArgs,
    timeout: Duration,
}

struct PluginOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ExecDelegator {
    pub fn new(args: &CmdArgs, timeout: Duration) -> Self {
        let mut args = args.clone();
        args.stdin_data.clear();
        Self { args, timeout }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        std::env::split_paths(&self.args.path)
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect()
    }

    fn find_plugin(&self, plugin: &str) -> Result<PathBuf, DelegateError> {
        let dirs = self.search_dirs();
        let found = if Path::new(plugin).components().count() == 1 {
            dirs.iter().map(|dir| dir.join(plugin)).find(|candidate| {
                candidate.is_file()
                    && candidate
                        .metadata()
                        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
                        .unwrap_or(false)
            })
        } else {
            None
        };
        found.ok_or_else(|| {
            let dirs: Vec<String> = dirs.iter().map(|dir| dir.display().to_string()).collect();
            DelegateError::new(
                CODE_INTERNAL,
                format!(
                    "failed to find plugin \"{}\" in path [{}]",
                    plugin,
                    dirs.join(" ")
                ),
                "",
            )
        })
    }

    fn execute(
        &self,
        command: CniCommand,
        plugin: &str,
        netconf: &[u8],
    ) -> Result<Vec<u8>, DelegateError> {
        let binary = self.find_plugin(plugin)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                DelegateError::new(CODE_INTERNAL, "starting delegate runtime", e.to_string())
            })?;

        let started = Instant::now();
        let output = runtime.block_on(self.run_plugin(command, &binary, netconf))?;
        let elapsed_ms = started.elapsed().as_millis().to_string();
        let status = output.status.to_string();
        log_debug(
            COMPONENT,
            "Delegate plugin finished",
            &[
                ("plugin", plugin),
                ("command", command.as_str()),
                ("status", &status),
                ("elapsed_ms", &elapsed_ms),
            ],
        );

        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(plugin_failure(plugin, &output))
    }

    async fn run_plugin(
        &self,
        command: CniCommand,
        binary: &Path,
        netconf: &[u8],
    ) -> Result<PluginOutput, DelegateError> {
        let mut process = Command::new(binary);
        process
            .envs(self.args.delegate_env(command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|e| {
            DelegateError::new(
                CODE_INTERNAL,
                format!("failed to execute plugin {}", binary.display()),
                e.to_string(),
            )
        })?;

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // The deadline covers the pipes too: a background process that
        // inherited stdout must not hold the wrapper past the timeout.
        let exchange = async {
            tokio::join!(
                child.wait(),
                feed_stdin(stdin_pipe, netconf),
                drain(stdout_pipe),
                drain(stderr_pipe),
            )
        };
        let outcome = time::timeout(self.timeout, exchange).await;

        match outcome {
            Ok((status, (), stdout, stderr)) => {
                let status = status.map_err(|e| {
                    DelegateError::new(CODE_INTERNAL, "waiting for delegate plugin", e.to_string())
                })?;
                Ok(PluginOutput {
                    status,
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let timeout = format!("{:?}", self.timeout);
                log_warn(
                    COMPONENT,
                    "Delegate plugin timed out",
                    &[("plugin", &binary.display().to_string()), ("timeout", &timeout)],
                );
                Err(DelegateError::new(
                    CODE_TRY_AGAIN_LATER,
                    format!("delegate plugin {} timed out after {}", binary.display(), timeout),
                    "",
                ))
            }
        }
    }
}

async fn feed_stdin(pipe: Option<ChildStdin>, input: &[u8]) {
    if let Some(mut writer) = pipe {
        let _ = writer.write_all(input).await;
        let _ = writer.shutdown().await;
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = pipe {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

fn plugin_failure(plugin: &str, output: &PluginOutput) -> DelegateError {
    if let Ok(error) = serde_json::from_slice::<CniError>(&output.stdout) {
        return DelegateError::from(error);
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let details = [stdout, stderr]
        .into_iter()
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    DelegateError::new(
        CODE_INTERNAL,
        format!("delegate plugin {} failed ({})", plugin, output.status),
        details,
    )
}

impl Delegator for ExecDelegator {
    fn delegate_add(&self, plugin: &str, netconf: &[u8]) -> DynResult<Value> {
        let stdout = self.execute(CniCommand::Add, plugin, netconf)?;
        let result = serde_json::from_slice(&stdout).map_err(|e| {
            DelegateError::new(
                CODE_INTERNAL,
                format!("decoding result of delegate plugin {}", plugin),
                e.to_string(),
            )
        })?;
        Ok(result)
    }

    fn delegate_del(&self, plugin: &str, netconf: &[u8]) -> DynResult<()> {
        self.execute(CniCommand::Del, plugin, netconf)?;
        Ok(())
    }
}
