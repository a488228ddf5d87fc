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

use crate::wrapper::logger::log_debug;
use crate::wrapper::util::error::{classified, classified_with_context, DynResult, ErrorKind};

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive advisory lock on the shared iptables lock file.
///
/// Every mutation of the firewall tables or the container state store happens
/// while one of these is held. The lock is released when the guard drops.
#[derive(Debug)]
pub struct IptablesLock {
    file: File,
    path: PathBuf,
}

impl IptablesLock {
    /// Blocks until the lock is held or `timeout` elapses.
    pub fn acquire(path: impl AsRef<Path>, timeout: Duration) -> DynResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                classified_with_context(
                    ErrorKind::Lock,
                    e,
                    format!("acquiring iptables lock: creating {}", parent.display()),
                )
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                classified_with_context(
                    ErrorKind::Lock,
                    e,
                    format!("acquiring iptables lock: opening {}", path.display()),
                )
            })?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= timeout {
                        return Err(classified(
                            ErrorKind::Lock,
                            format!("acquiring iptables lock: timed out after {:?}", timeout),
                        ));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(classified_with_context(
                        ErrorKind::Lock,
                        e,
                        "acquiring iptables lock",
                    ))
                }
            }
        }

        let waited = started.elapsed().as_millis().to_string();
        log_debug(
            "lock",
            "Acquired iptables lock",
            &[
                ("path", &path.display().to_string()),
                ("waited_ms", &waited),
            ],
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == IoErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for IptablesLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
