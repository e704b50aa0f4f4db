// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Uploaded code versions of a Generic service.
//!
//! Archives are stored as `<root>/<code version id>`. The index lives in
//! memory; the built-in `code-default` version has no archive and tells
//! the agents to use their bundled default scripts.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::error::{ManagerError, Result};
use crate::jsonrpc::FilePart;
use crate::state::lock;

/// Id of the version every service starts with.
pub const DEFAULT_VERSION: &str = "code-default";

/// Archive format of a code version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    /// Zip archive.
    Zip,
    /// Tar archive, optionally gzip compressed.
    Tar,
}

impl ArchiveType {
    /// Sniff the format from the archive's leading bytes.
    pub fn detect(content: &[u8]) -> Option<Self> {
        if content.starts_with(b"PK\x03\x04") {
            Some(Self::Zip)
        } else if content.starts_with(&[0x1f, 0x8b])
            || content.get(257..262).is_some_and(|magic| magic == b"ustar")
        {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Name sent to the agent.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

/// One stored code version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeVersion {
    /// Version id.
    pub code_version_id: String,
    /// Name of the uploaded file.
    pub filename: String,
    /// Free text from the uploader.
    pub description: String,
    /// Upload time, seconds since the epoch.
    pub time: i64,
    /// Archive format.
    #[serde(skip)]
    pub filetype: ArchiveType,
}

#[derive(Debug)]
struct CodeIndex {
    versions: Vec<CodeVersion>,
    current: String,
}

/// On-disk store of code versions.
#[derive(Debug)]
pub struct CodeRepo {
    root: PathBuf,
    index: Mutex<CodeIndex>,
}

impl CodeRepo {
    /// Open a store rooted at `root`. The directory is created on first upload.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let default = CodeVersion {
            code_version_id: DEFAULT_VERSION.to_string(),
            filename: format!("{}.tar", DEFAULT_VERSION),
            description: "Initial version".to_string(),
            time: Utc::now().timestamp(),
            filetype: ArchiveType::Tar,
        };
        Self {
            root: root.into(),
            index: Mutex::new(CodeIndex {
                versions: vec![default],
                current: DEFAULT_VERSION.to_string(),
            }),
        }
    }

    /// Versions newest first, the active one flagged with `current`.
    pub fn list(&self) -> Value {
        let index = lock(&self.index);
        let versions: Vec<Value> = index
            .versions
            .iter()
            .rev()
            .map(|v| {
                let mut entry = json!(v);
                if v.code_version_id == index.current {
                    entry["current"] = json!(true);
                }
                entry
            })
            .collect();
        Value::from(versions)
    }

    /// Look a version up.
    pub fn get(&self, id: &str) -> Result<CodeVersion> {
        lock(&self.index)
            .versions
            .iter()
            .find(|v| v.code_version_id == id)
            .cloned()
            .ok_or_else(|| ManagerError::invalid(format!("codeVersionId: unknown code version '{}'", id)))
    }

    /// The active version.
    pub fn current(&self) -> Result<CodeVersion> {
        let id = lock(&self.index).current.clone();
        self.get(&id)
    }

    /// Make `id` the active version.
    pub fn set_current(&self, id: &str) -> Result<()> {
        self.get(id)?;
        lock(&self.index).current = id.to_string();
        Ok(())
    }

    /// Store an uploaded archive as a new version.
    pub async fn store(&self, file: FilePart, description: &str) -> Result<CodeVersion> {
        let filetype = ArchiveType::detect(&file.content)
            .ok_or_else(|| ManagerError::invalid("code: expected a zip or tar archive"))?;
        let id = format!("code-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(&id), &file.content).await?;

        let version = CodeVersion {
            code_version_id: id,
            filename: file.filename,
            description: description.to_string(),
            time: Utc::now().timestamp(),
            filetype,
        };
        info!(code_version = %version.code_version_id, filename = %version.filename, "Stored code version");
        lock(&self.index).versions.push(version.clone());
        Ok(version)
    }

    /// Archive content of a version; `None` for the built-in default.
    pub async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.get(id)?;
        if id == DEFAULT_VERSION {
            return Ok(None);
        }
        Ok(Some(tokio::fs::read(self.root.join(id)).await?))
    }

    /// The version as an upload for the agents.
    pub async fn file_part(&self, version: &CodeVersion) -> Result<Option<FilePart>> {
        Ok(self
            .read(&version.code_version_id)
            .await?
            .map(|content| FilePart::new("file", version.filename.clone(), content)))
    }

    /// Forget a version and delete its archive. The active one is refused.
    pub async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut index = lock(&self.index);
            if index.current == id {
                return Err(ManagerError::invalid("Cannot remove the active code version"));
            }
            let before = index.versions.len();
            index.versions.retain(|v| v.code_version_id != id);
            if index.versions.len() == before {
                return Err(ManagerError::invalid(format!(
                    "codeVersionId: unknown code version '{}'",
                    id
                )));
            }
        }
        match tokio::fs::remove_file(self.root.join(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
