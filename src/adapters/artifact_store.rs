use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::domain::{ArtifactRecord, DomainError, ModelManifest, TransferError};

/// Suffix of in-progress temporary files.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Manifest sidecar kept in every model directory.
pub const MANIFEST_FILE: &str = ".manifest.json";

/// Filesystem store for downloaded artifacts.
///
/// Layout: `<root>/<model_dir>/<file_name>` for verified files and
/// `<root>/<model_dir>/<file_name>.partial` for in-progress data, where
/// `model_dir` is the model identifier with `%` and `/` percent-escaped
/// (see [`encode_model_id`]). Each model directory also holds the manifest
/// as [`MANIFEST_FILE`] so the catalog survives restarts.
/// A file at the final path is always complete and verified.
pub struct ArtifactStore {
    root: PathBuf,
}

/// Exclusive append handle on a record's temporary file.
pub struct PartialFile {
    file: fs::File,
    path: PathBuf,
    resume_offset: u64,
    written: u64,
}

impl PartialFile {
    /// Length of the temporary file when it was opened.
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    /// Current length of the temporary file.
    pub fn len(&self) -> u64 {
        self.resume_offset + self.written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush buffered data and sync it to disk.
    pub async fn sync(&mut self) -> Result<(), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

impl ArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DomainError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        info!(root = ?root, "ArtifactStore initialized");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every file of one model.
    pub fn model_dir(&self, model_id: &str) -> Result<PathBuf, TransferError> {
        let trimmed = model_id.trim();
        if trimmed.is_empty()
            || trimmed.contains('\\')
            || trimmed.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(TransferError::Storage(format!(
                "Invalid model identifier: {:?}",
                model_id
            )));
        }
        Ok(self.root.join(encode_model_id(trimmed)))
    }

    /// Validate a repository-relative file name.
    fn relative_path(file_name: &str) -> Result<PathBuf, TransferError> {
        let path = Path::new(file_name);
        let valid = !file_name.is_empty()
            && file_name != MANIFEST_FILE
            && !file_name.contains('\\')
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(TransferError::Storage(format!(
                "Invalid artifact file name: {:?}",
                file_name
            )));
        }
        Ok(path.to_path_buf())
    }

    /// Canonical location of the verified file.
    pub fn final_path(&self, record: &ArtifactRecord) -> Result<PathBuf, TransferError> {
        Ok(self
            .model_dir(&record.model_id)?
            .join(Self::relative_path(&record.file_name)?))
    }

    /// Location of in-progress data.
    pub fn partial_path(&self, record: &ArtifactRecord) -> Result<PathBuf, TransferError> {
        let mut path = self.final_path(record)?.into_os_string();
        path.push(PARTIAL_SUFFIX);
        Ok(PathBuf::from(path))
    }

    /// Create or reopen the temporary file for appending.
    ///
    /// The returned handle reports the existing length as the resume offset.
    pub async fn open_for_write(&self, record: &ArtifactRecord) -> Result<PartialFile, TransferError> {
        let path = self.partial_path(record)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let resume_offset = file.metadata().await?.len();

        debug!(
            model_id = %record.model_id,
            file = %record.file_name,
            resume_offset,
            "Opened partial file"
        );

        Ok(PartialFile {
            file,
            path,
            resume_offset,
            written: 0,
        })
    }

    /// Length of existing in-progress data, 0 if there is none.
    pub async fn partial_len(&self, record: &ArtifactRecord) -> u64 {
        match self.partial_path(record) {
            Ok(path) => fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Delete in-progress data. Missing data is not an error.
    pub async fn discard_partial(&self, record: &ArtifactRecord) -> Result<(), TransferError> {
        let path = self.partial_path(record)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, "Discarded partial file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a verified file with the expected size is in place.
    pub async fn is_complete(&self, record: &ArtifactRecord) -> bool {
        match self.final_path(record) {
            Ok(path) => fs::metadata(&path)
                .await
                .map(|m| m.is_file() && m.len() == record.expected_size)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Promote the temporary file to the final path.
    ///
    /// The rename only happens when the size matches and, if the record has an
    /// expected checksum, `computed_checksum` matches it. Otherwise the
    /// temporary file is discarded and an integrity error is returned.
    /// Finalizing an already finalized record is a no-op.
    pub async fn finalize(
        &self,
        record: &ArtifactRecord,
        computed_checksum: &str,
    ) -> Result<PathBuf, TransferError> {
        let final_path = self.final_path(record)?;
        let partial_path = self.partial_path(record)?;

        let partial_len = match fs::metadata(&partial_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.is_complete(record).await {
                    debug!(path = ?final_path, "Artifact already finalized");
                    return Ok(final_path);
                }
                return Err(TransferError::Storage(format!(
                    "No downloaded data for {}",
                    record.key()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if partial_len != record.expected_size {
            self.discard_partial(record).await?;
            warn!(
                model_id = %record.model_id,
                file = %record.file_name,
                expected = record.expected_size,
                actual = partial_len,
                "Artifact size mismatch, discarded"
            );
            return Err(TransferError::Integrity {
                expected: format!("{} bytes", record.expected_size),
                actual: format!("{} bytes", partial_len),
            });
        }

        let computed = computed_checksum.trim().to_ascii_lowercase();
        if let Some(expected) = &record.expected_checksum {
            if *expected != computed {
                self.discard_partial(record).await?;
                warn!(
                    model_id = %record.model_id,
                    file = %record.file_name,
                    expected = %expected,
                    actual = %computed,
                    "Artifact checksum mismatch, discarded"
                );
                return Err(TransferError::Integrity {
                    expected: expected.clone(),
                    actual: computed,
                });
            }
        }

        fs::rename(&partial_path, &final_path).await?;

        info!(
            model_id = %record.model_id,
            file = %record.file_name,
            size = partial_len,
            sha256 = %computed,
            "Artifact verified and finalized"
        );
        Ok(final_path)
    }

    /// Delete every final and temporary file of a model. Safe in any state.
    pub async fn remove(&self, model_id: &str) -> Result<(), TransferError> {
        let dir = self.model_dir(model_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(model_id = model_id, dir = ?dir, "Model files removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the manifest sidecar, replacing any previous one atomically.
    pub async fn save_manifest(&self, manifest: &ModelManifest) -> Result<(), TransferError> {
        let dir = self.model_dir(&manifest.model_id)?;
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| TransferError::Storage(format!("Failed to encode manifest: {}", e)))?;
        let tmp = dir.join(format!("{}{}", MANIFEST_FILE, PARTIAL_SUFFIX));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE)).await?;

        debug!(model_id = %manifest.model_id, "Manifest saved");
        Ok(())
    }

    /// Read every manifest sidecar under the root, sorted by model identifier.
    ///
    /// Unreadable sidecars and sidecars whose identifier does not match their
    /// directory are skipped with a warning.
    pub async fn load_manifests(&self) -> Result<Vec<ModelManifest>, DomainError> {
        let mut manifests = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let dir_name = entry.file_name();
            let Some(model_id) = dir_name.to_str().and_then(decode_model_dir) else {
                continue;
            };

            let path = entry.path().join(MANIFEST_FILE);
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read manifest");
                    continue;
                }
            };

            match serde_json::from_slice::<ModelManifest>(&raw) {
                Ok(manifest) if manifest.model_id == model_id => manifests.push(manifest),
                Ok(manifest) => warn!(
                    path = ?path,
                    model_id = %manifest.model_id,
                    "Manifest does not belong to its directory, skipped"
                ),
                Err(e) => warn!(path = ?path, error = %e, "Corrupt manifest, skipped"),
            }
        }

        manifests.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        debug!(count = manifests.len(), "Manifests loaded");
        Ok(manifests)
    }

    /// SHA-256 of a file, computed on the blocking pool.
    pub async fn checksum(path: &Path) -> Result<String, TransferError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| TransferError::Storage(format!("Checksum task failed: {}", e)))?
    }
}

/// Directory name of a model. `%` and `/` are escaped as `%25` and `%2F`,
/// so distinct identifiers never share a directory.
pub fn encode_model_id(model_id: &str) -> String {
    let mut out = String::with_capacity(model_id.len());
    for c in model_id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`encode_model_id`]. None for names it cannot have produced.
pub fn decode_model_dir(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let decoded = match rest.get(pos + 1..pos + 3)? {
            "2F" => '/',
            "25" => '%',
            _ => return None,
        };
        out.push(decoded);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Calculate the SHA-256 hash of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
