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

use crate::wrapper::cni::args::{CmdArgs, Command};
use crate::wrapper::cni::controller::PluginController;
use crate::wrapper::cni::delegator::ExecDelegator;
use crate::wrapper::cni::rules::IptablesCommand;
use crate::wrapper::cni::types::{CniError, DelegateError, VersionInfo, CODE_INTERNAL};
use crate::wrapper::config::Config;
use crate::wrapper::logger::log_error;
use crate::wrapper::util::error::{error_kind, AggregateError};

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::io::Write;
use std::sync::Arc;

const COMPONENT: &str = "plugin";

/// Runs one CNI invocation against the production delegator and iptables,
/// writing the result or error object to `out`. Returns the process exit code.
pub fn run(env: &HashMap<String, String>, stdin: Vec<u8>, out: &mut dyn Write) -> i32 {
    let args = match CmdArgs::from_env(env, stdin) {
        Ok(args) => args,
        Err(err) => return report_error(out, None, err.as_ref()),
    };
    if args.command == Command::Version {
        return write_json(out, &VersionInfo::current());
    }

    let delegator = ExecDelegator::new(&args, Config::DelegateTimeout.duration());
    let controller = PluginController::new(Arc::new(delegator), Arc::new(IptablesCommand::new()));
    run_with(&controller, &args, out)
}

/// Dispatches an already parsed invocation to `controller`.
pub fn run_with(controller: &PluginController, args: &CmdArgs, out: &mut dyn Write) -> i32 {
    let outcome = match args.command {
        Command::Add => controller.add(args).map(Some),
        Command::Del => controller.del(args).map(|_| None),
        Command::Version => return write_json(out, &VersionInfo::current()),
    };
    match outcome {
        Ok(Some(result)) => write_json(out, &result),
        Ok(None) => 0,
        Err(err) => report_error(out, requested_version(&args.stdin_data), err.as_ref()),
    }
}

/// CNI error code for a failure surfaced by the wrapper.
pub fn error_code(err: &(dyn Error + Send + Sync + 'static)) -> u32 {
    if let Some(delegate) = err.downcast_ref::<DelegateError>() {
        return delegate.code;
    }
    if err.downcast_ref::<AggregateError>().is_some() {
        return CODE_INTERNAL;
    }
    error_kind(err)
        .map(|kind| kind.cni_code())
        .unwrap_or(CODE_INTERNAL)
}

fn to_cni_error(err: &(dyn Error + Send + Sync + 'static)) -> CniError {
    match err.downcast_ref::<DelegateError>() {
        Some(delegate) => CniError::new(delegate.code, &delegate.msg, &delegate.details),
        None => CniError::new(error_code(err), err.to_string(), ""),
    }
}

fn requested_version(stdin: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(stdin).ok()?;
    value
        .get("cniVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn report_error(
    out: &mut dyn Write,
    cni_version: Option<String>,
    err: &(dyn Error + Send + Sync + 'static),
) -> i32 {
    let mut error = to_cni_error(err);
    error.cni_version = cni_version;
    let code = error.code.to_string();
    log_error(
        COMPONENT,
        "Invocation failed",
        &[("code", &code), ("error", &err.to_string())],
    );
    write_json(out, &error);
    1
}

fn write_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> i32 {
    let written = serde_json::to_writer(&mut *out, value)
        .map_err(|e| e.to_string())
        .and_then(|_| writeln!(out).map_err(|e| e.to_string()))
        .and_then(|_| out.flush().map_err(|e| e.to_string()));
    match written {
        Ok(()) => 0,
        Err(error) => {
            log_error(COMPONENT, "Failed to write output", &[("error", &error)]);
            1
        }
    }
}
