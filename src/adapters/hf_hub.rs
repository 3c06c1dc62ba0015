use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::domain::{ArtifactKind, ArtifactRecord, DomainError, HubConfig, ModelManifest};
use crate::ports::{HttpClient, ModelHub};

/// Model metadata as returned by `GET /api/models/{id}/revision/{rev}?blobs=true`.
#[derive(Debug, Deserialize)]
struct ModelInfo {
    /// Commit the revision resolved to.
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
    #[serde(default)]
    safetensors: Option<SafetensorsInfo>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsInfo {
    #[serde(default)]
    total: Option<u64>,
}

/// `model.safetensors.index.json`: tensor name to shard file.
#[derive(Debug, Deserialize)]
struct ShardIndex {
    #[serde(default)]
    weight_map: HashMap<String, String>,
}

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Weight formats in order of preference. Only the best format present is kept,
/// and a GGUF repository must be narrowed to a single variant.
const WEIGHT_FORMATS: &[&[&str]] = &[&["safetensors"], &["bin"], &["pth", "pt"], &["gguf"]];

/// Hugging Face Hub client.
pub struct HfHubClient {
    http: Arc<dyn HttpClient>,
    endpoint: String,
    default_revision: String,
}

impl HfHubClient {
    pub fn new(http: Arc<dyn HttpClient>, config: &HubConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            default_revision: config.revision.clone(),
        }
    }

    fn info_url(&self, model_id: &str, revision: &str) -> String {
        format!(
            "{}/api/models/{}/revision/{}?blobs=true",
            self.endpoint,
            model_id,
            encode_revision(revision)
        )
    }

    fn file_url(&self, model_id: &str, revision: &str, file_name: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            model_id,
            encode_revision(revision),
            file_name
        )
    }

    /// Build the manifest from hub metadata.
    ///
    /// `shard_index` holds the files named by `model.safetensors.index.json`
    /// when the repository has one.
    fn build_manifest(
        &self,
        model_id: &str,
        revision: &str,
        info: ModelInfo,
        weights_filter: Option<&str>,
        shard_index: Option<HashSet<String>>,
    ) -> Result<ModelManifest, DomainError> {
        let candidates: Vec<(ArtifactKind, &Sibling)> = info
            .siblings
            .iter()
            .filter(|s| !s.rfilename.contains('/'))
            .filter_map(|s| ArtifactKind::classify(&s.rfilename).map(|kind| (kind, s)))
            .collect();

        let mut weights: Vec<&str> = candidates
            .iter()
            .filter(|(kind, _)| *kind == ArtifactKind::Weights)
            .map(|(_, s)| s.rfilename.as_str())
            .collect();

        if let Some(filter) = weights_filter {
            let needle = filter.to_ascii_lowercase();
            weights.retain(|name| *name == filter || name.to_ascii_lowercase().contains(&needle));
            if weights.is_empty() {
                return Err(DomainError::Hub(format!(
                    "No weight file of {} matches {:?}",
                    model_id, filter
                )));
            }
        }

        let Some(preferred) = WEIGHT_FORMATS
            .iter()
            .find(|formats| weights.iter().any(|name| formats.contains(&weight_ext(name).as_str())))
        else {
            return Err(DomainError::Hub(format!(
                "{} has no supported weight files",
                model_id
            )));
        };
        weights.retain(|name| preferred.contains(&weight_ext(name).as_str()));

        if preferred.contains(&"safetensors") {
            if let Some(index) = &shard_index {
                let listed: Vec<&str> = weights
                    .iter()
                    .copied()
                    .filter(|name| index.contains(*name))
                    .collect();
                if !listed.is_empty() {
                    weights = listed;
                }
            }
        }

        if preferred.contains(&"gguf") {
            let variants: BTreeSet<&str> = weights.iter().copied().map(shard_group).collect();
            if variants.len() > 1 {
                return Err(DomainError::WeightsChoiceRequired {
                    model_id: model_id.to_string(),
                    options: variants.into_iter().map(str::to_string).collect(),
                });
            }
        }

        let mut records = Vec::new();
        for (kind, sibling) in candidates {
            let name = sibling.rfilename.as_str();
            let keep = match kind {
                ArtifactKind::Weights => weights.contains(&name),
                // Shard indexes only matter for the chosen weight format.
                _ => match name.strip_suffix(".index.json") {
                    Some(indexed) => preferred.contains(&weight_ext(indexed).as_str()),
                    None => true,
                },
            };
            if !keep {
                debug!(file = %name, "Skipping unused weight file");
                continue;
            }

            let size = sibling
                .lfs
                .as_ref()
                .and_then(|lfs| lfs.size)
                .or(sibling.size)
                .ok_or_else(|| DomainError::Hub(format!("No size reported for {}", name)))?;

            let mut record = ArtifactRecord::new(
                model_id,
                name,
                self.file_url(model_id, revision, name),
                kind,
                size,
            );
            if let Some(sha) = sibling.lfs.as_ref().and_then(|lfs| lfs.sha256.as_deref()) {
                record = record.with_checksum(sha);
            }
            records.push(record);
        }

        records.sort_by(|a, b| (a.kind, &a.file_name).cmp(&(b.kind, &b.file_name)));

        let mut manifest = ModelManifest::new(model_id, records);
        manifest.revision = Some(revision.to_string());
        manifest.parameter_count = info.safetensors.and_then(|s| s.total);
        Ok(manifest)
    }

    /// Files named by the safetensors shard index.
    async fn fetch_shard_index(
        &self,
        model_id: &str,
        revision: &str,
    ) -> Result<HashSet<String>, DomainError> {
        let url = self.file_url(model_id, revision, SAFETENSORS_INDEX);
        let index: ShardIndex = serde_json::from_str(&self.http.get_text(&url).await?)?;
        Ok(index.weight_map.into_values().collect())
    }
}

fn weight_ext(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Name of a weight file without extension and `-00001-of-00004` shard suffix.
fn shard_group(file_name: &str) -> &str {
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if let Some((head, total)) = stem.rsplit_once("-of-") {
        if let Some((group, part)) = head.rsplit_once('-') {
            if digits(part) && digits(total) {
                return group;
            }
        }
    }
    stem
}

/// Branch names may contain `/`, which must not split the URL path.
fn encode_revision(revision: &str) -> String {
    revision.replace('/', "%2F")
}

#[async_trait]
impl ModelHub for HfHubClient {
    async fn resolve(
        &self,
        model_id: &str,
        revision: Option<&str>,
        weights: Option<&str>,
    ) -> Result<ModelManifest, DomainError> {
        let model_id = model_id.trim().trim_matches('/');
        if model_id.is_empty() || model_id.split('/').any(|p| p.is_empty() || p == "..") {
            return Err(DomainError::ModelNotFound(format!(
                "Invalid model identifier: {:?}",
                model_id
            )));
        }
        let requested = revision.unwrap_or(&self.default_revision);
        let weights = weights.map(str::trim).filter(|w| !w.is_empty());

        let body = match self.http.get_text(&self.info_url(model_id, requested)).await {
            Ok(body) => body,
            Err(DomainError::HttpStatus { status: 404, .. }) => {
                return Err(DomainError::ModelNotFound(model_id.to_string()));
            }
            Err(DomainError::HttpStatus {
                status: status @ (401 | 403),
                ..
            }) => {
                warn!(model_id = model_id, status, "Hub refused model metadata");
                return Err(DomainError::Hub(format!(
                    "Access to {} denied (HTTP {}); it may be gated or private and need a token",
                    model_id, status
                )));
            }
            Err(e) => return Err(e),
        };

        let info: ModelInfo = serde_json::from_str(&body)?;
        let revision = info.sha.clone().unwrap_or_else(|| requested.to_string());

        let shard_index = if info.siblings.iter().any(|s| s.rfilename == SAFETENSORS_INDEX) {
            Some(self.fetch_shard_index(model_id, &revision).await?)
        } else {
            None
        };

        let manifest = self.build_manifest(model_id, &revision, info, weights, shard_index)?;

        info!(
            model_id = model_id,
            revision = ?manifest.revision,
            files = manifest.records.len(),
            total_bytes = manifest.total_bytes(),
            parameters = ?manifest.parameter_count,
            "Model manifest resolved"
        );
        Ok(manifest)
    }
}
