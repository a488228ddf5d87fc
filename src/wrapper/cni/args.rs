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

use crate::wrapper::util::error::{classified, DynResult, ErrorKind};

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Version,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Version => "VERSION",
        }
    }
}

/// One plugin invocation as described by the runtime's CNI environment and stdin.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    pub command: Command,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    pub fn from_env(env: &HashMap<String, String>, stdin_data: Vec<u8>) -> DynResult<Self> {
        let command = match env.get("CNI_COMMAND").map(String::as_str) {
            Some("ADD") => Command::Add,
            Some("DEL") => Command::Del,
            Some("VERSION") => Command::Version,
            Some(other) => {
                return Err(classified(
                    ErrorKind::Environment,
                    format!("unknown CNI_COMMAND: {}", other),
                ))
            }
            None => return Err(classified(ErrorKind::Environment, "CNI_COMMAND not set")),
        };

        let lookup = |key: &str| env.get(key).cloned().unwrap_or_default();
        let container_id = lookup("CNI_CONTAINERID");
        let ifname = lookup("CNI_IFNAME");

        if command != Command::Version && container_id.is_empty() {
            return Err(classified(ErrorKind::Environment, "CNI_CONTAINERID not set"));
        }
        if command == Command::Add && ifname.is_empty() {
            return Err(classified(ErrorKind::Environment, "CNI_IFNAME not set"));
        }

        Ok(Self {
            command,
            container_id,
            netns: lookup("CNI_NETNS"),
            ifname,
            args: lookup("CNI_ARGS"),
            path: lookup("CNI_PATH"),
            stdin_data,
        })
    }

    /// Environment handed to a delegate for `command`, mirroring what this
    /// plugin received.
    pub fn delegate_env(&self, command: Command) -> Vec<(&'static str, String)> {
        vec![
            ("CNI_COMMAND", command.as_str().to_string()),
            ("CNI_CONTAINERID", self.container_id.clone()),
            ("CNI_NETNS", self.netns.clone()),
            ("CNI_IFNAME", self.ifname.clone()),
            ("CNI_ARGS", self.args.clone()),
            ("CNI_PATH", self.path.clone()),
        ]
    }
}
