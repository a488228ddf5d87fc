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

use crate::wrapper::cni::config::RuntimePortMapping;
use crate::wrapper::cni::rules::Operation;
use crate::wrapper::logger::log_debug;
use crate::wrapper::util::error::{
    classified, classified_with_context, with_context, DynResult, ErrorKind,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "store";

/// Facts recorded at ADD time that are needed to undo the container's rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub egress_interfaces: Vec<String>,
    #[serde(default)]
    pub port_mappings: Vec<RuntimePortMapping>,
    /// Firewall operations installed for the container, in apply order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Operation>,
}

type Records = BTreeMap<String, ContainerRecord>;

/// File-backed map from container id to [`ContainerRecord`].
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, container_id: &str) -> DynResult<Option<ContainerRecord>> {
        validate_id(container_id)?;
        let _lock = self.lock(false)?;
        let mut records = self.read()?;
        Ok(records.remove(container_id))
    }

    /// Stores `record`, replacing any previous record for the container.
    pub fn put(&self, container_id: &str, record: &ContainerRecord) -> DynResult<()> {
        validate_id(container_id)?;
        let _lock = self.lock(true)?;
        let mut records = self.read()?;
        records.insert(container_id.to_string(), record.clone());
        self.write(&records)?;
        log_debug(
            COMPONENT,
            "Stored container record",
            &[("container_id", container_id), ("ip", &record.ip.to_string())],
        );
        Ok(())
    }

    /// Removes the record; a container without one is not an error.
    pub fn delete(&self, container_id: &str) -> DynResult<()> {
        validate_id(container_id)?;
        let _lock = self.lock(true)?;
        let mut records = self.read()?;
        if records.remove(container_id).is_some() {
            self.write(&records)?;
            log_debug(
                COMPONENT,
                "Deleted container record",
                &[("container_id", container_id)],
            );
        }
        Ok(())
    }

    pub fn list(&self) -> DynResult<Vec<String>> {
        let _lock = self.lock(false)?;
        Ok(self.read()?.into_keys().collect())
    }

    fn lock(&self, exclusive: bool) -> DynResult<StoreLock> {
        let path = sibling(&self.path, ".lock");
        StoreLock::new(&path, exclusive).map_err(|e| {
            classified_with_context(
                ErrorKind::StateStore,
                e,
                format!("locking datastore '{}'", path.display()),
            )
        })
    }

    fn read(&self) -> DynResult<Records> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => {
                return Err(classified_with_context(
                    ErrorKind::StateStore,
                    e,
                    format!("reading datastore '{}'", self.path.display()),
                ))
            }
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Records::new());
        }
        serde_json::from_slice(&data).map_err(|e| {
            classified_with_context(
                ErrorKind::StateStore,
                e,
                format!("decoding datastore '{}'", self.path.display()),
            )
        })
    }

    fn write(&self, records: &Records) -> DynResult<()> {
        let data = serde_json::to_vec_pretty(records).map_err(|e| {
            classified_with_context(ErrorKind::StateStore, e, "encoding datastore")
        })?;
        persist_atomically(&self.path, &data).map_err(|e| {
            classified_with_context(
                ErrorKind::StateStore,
                e,
                format!("writing datastore '{}'", self.path.display()),
            )
        })
    }
}

fn validate_id(container_id: &str) -> DynResult<()> {
    if container_id.is_empty() {
        return Err(classified(ErrorKind::StateStore, "container id must not be empty"));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

struct StoreLock {
    file: File,
}

impl StoreLock {
    fn new(path: &Path, exclusive: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            FileExt::lock_shared(&file)?;
        }
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn persist_atomically(target: &Path, data: &[u8]) -> DynResult<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                with_context(
                    e,
                    format!("Failed to create parent directory '{}'", parent.display()),
                )
            })?;
        }
    }

    let tmpfile_path = sibling(target, ".tmp");
    let mut tmp_guard = TempFileGuard::new(tmpfile_path.clone());
    let mut tmpfile = File::create(&tmpfile_path).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to create temporary file '{}'",
                tmpfile_path.display()
            ),
        )
    })?;
    tmpfile.write_all(data).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to write to temporary file '{}'",
                tmpfile_path.display()
            ),
        )
    })?;
    tmpfile.sync_all().map_err(|e| {
        with_context(
            e,
            format!("Failed to sync temporary file '{}'", tmpfile_path.display()),
        )
    })?;
    drop(tmpfile);

    fs::rename(&tmpfile_path, target).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to move '{}' into place at '{}'",
                tmpfile_path.display(),
                target.display()
            ),
        )
    })?;
    tmp_guard.keep();
    sync_parent(target)
}

fn sync_parent(path: &Path) -> DynResult<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        let dir_file = File::open(dir).map_err(|e| {
            with_context(e, format!("Failed to open directory '{}'", dir.display()))
        })?;
        dir_file.sync_all().map_err(|e| {
            with_context(e, format!("Failed to sync directory '{}'", dir.display()))
        })?;
    }
    Ok(())
}

struct TempFileGuard {
    path: PathBuf,
    keep: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}
