//! Local identity: assembles the discovery packet describing this node.
//!
//! Labels come from three places:
//!
//! * **initial labels** from the configuration,
//! * **filesystem labels**, every file in the labels directory, one label
//!   per line,
//! * **runtime labels**, a single file in the same directory owned by the
//!   daemon and rewritten whenever labels are added or removed through the
//!   management API.
//!
//! Only runtime labels can be changed at runtime.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::types::{parse_labels, Discovery, Label};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("reading labels from {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("writing runtime labels to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("hostname detection failed: {0}")]
    Hostname(io::Error),
    #[error("hostname is not valid UTF-8")]
    InvalidHostname,
}

pub struct LocalHost {
    hostname: Option<String>,
    initial_labels: Vec<Label>,
    labels_path: PathBuf,
    runtime_labels_filename: String,
    // Serialises read-modify-write cycles of the runtime labels file.
    write_lock: Mutex<()>,
}

impl LocalHost {
    pub fn new(
        hostname: Option<String>,
        initial_labels: Vec<Label>,
        labels_path: impl Into<PathBuf>,
        runtime_labels_filename: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.filter(|h| !h.is_empty()),
            initial_labels,
            labels_path: labels_path.into(),
            runtime_labels_filename: runtime_labels_filename.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn runtime_labels_path(&self) -> PathBuf {
        self.labels_path.join(&self.runtime_labels_filename)
    }

    /// Discovery packet of this node with all labels merged and sorted.
    pub async fn get_identification(&self) -> Result<Discovery, IdentityError> {
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => hostname::get()
                .map_err(IdentityError::Hostname)?
                .into_string()
                .map_err(|_| IdentityError::InvalidHostname)?,
        };

        let mut labels: BTreeSet<Label> = self.initial_labels.iter().cloned().collect();
        labels.extend(self.load_filesystem_labels().await?);
        labels.extend(self.load_runtime_labels().await?);

        Ok(Discovery::new(hostname, labels.into_iter().collect()))
    }

    /// Scans the labels directory.  A missing directory means no labels,
    /// the runtime labels file and hidden files are skipped.
    async fn load_filesystem_labels(&self) -> Result<Vec<Label>, IdentityError> {
        let read_err = |source| IdentityError::Read {
            path: self.labels_path.clone(),
            source,
        };

        let mut entries = match fs::read_dir(&self.labels_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(e)),
        };

        let mut labels = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == self.runtime_labels_filename.as_str() || name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await.map_err(read_err)?;
            if file_type.is_dir() {
                continue;
            }

            let path = entry.path();
            labels.extend(read_label_file(&path).await?);
        }
        debug!("loaded {} filesystem labels", labels.len());
        Ok(labels)
    }

    async fn load_runtime_labels(&self) -> Result<Vec<Label>, IdentityError> {
        let path = self.runtime_labels_path();
        match read_label_file(&path).await {
            Err(IdentityError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Adds runtime labels. Labels already present are left alone.
    pub async fn add_labels(&self, labels: &[Label]) -> Result<(), IdentityError> {
        let _guard = self.write_lock.lock().await;

        let mut current = self.load_runtime_labels().await?;
        for label in labels {
            if !current.contains(label) {
                current.push(label.clone());
            }
        }
        self.save_runtime_labels(&current).await
    }

    /// Removes runtime labels. Labels from configuration or other files
    /// are not touched.
    pub async fn delete_labels(&self, labels: &[Label]) -> Result<(), IdentityError> {
        let _guard = self.write_lock.lock().await;

        let mut current = self.load_runtime_labels().await?;
        current.retain(|label| !labels.contains(label));
        self.save_runtime_labels(&current).await
    }

    pub async fn runtime_labels(&self) -> Result<Vec<Label>, IdentityError> {
        self.load_runtime_labels().await
    }

    // Written to a hidden sibling first and renamed over the target, so a
    // concurrent reader sees either the old or the new content.
    async fn save_runtime_labels(&self, labels: &[Label]) -> Result<(), IdentityError> {
        let path = self.runtime_labels_path();
        let tmp_path = self
            .labels_path
            .join(format!(".{}.tmp", self.runtime_labels_filename));
        let write_err = |source| IdentityError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.labels_path)
            .await
            .map_err(write_err)?;

        let mut content = String::new();
        for label in labels {
            content.push_str(label.as_str());
            content.push('\n');
        }

        let mut file = fs::File::create(&tmp_path).await.map_err(write_err)?;
        file.write_all(content.as_bytes()).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        fs::rename(&tmp_path, &path).await.map_err(write_err)
    }
}

async fn read_label_file(path: &Path) -> Result<Vec<Label>, IdentityError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_labels(&content))
}
