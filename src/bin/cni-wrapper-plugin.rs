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

use cni_wrapper::wrapper::cni::plugin;
use cni_wrapper::wrapper::logger;

use std::collections::HashMap;
use std::io::{self, Read};
use std::process;

fn main() {
    logger::init_from_env();

    let env: HashMap<String, String> = std::env::vars().collect();
    let mut stdin = Vec::new();
    if let Err(err) = io::stdin().read_to_end(&mut stdin) {
        logger::log_error(
            "plugin",
            "Failed to read network configuration",
            &[("error", &err.to_string())],
        );
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let code = plugin::run(&env, stdin, &mut out);
    process::exit(code);
}
