//! Local filesystem provider.
//!
//! Materializes each resource as a JSON document at
//! `<root>/<type>/<name>.json`. The document records the applied attribute
//! values and a stable `uid` generated on create. Outputs are `uid`, `path`
//! and `checksum` (SHA-256 of the stored attributes).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{ResourceId, Value};

use super::{ApplyRequest, Operation, Provider, ProviderState};

/// On-disk form of a managed resource.
#[derive(Debug, Serialize, Deserialize)]
struct Document {
    id: ResourceId,
    uid: String,
    attributes: BTreeMap<String, Value>,
}

/// Provider that manages JSON documents under a root directory.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the document path for a resource.
    #[must_use]
    pub fn document_path(&self, id: &ResourceId) -> PathBuf {
        self.root
            .join(&id.resource_type)
            .join(format!("{}.json", id.name))
    }

    async fn read_document(&self, id: &ResourceId) -> Result<Option<Document>, ProviderError> {
        let path = self.document_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProviderError::from_io(&format!("reading {}", path.display()), &e)),
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            ProviderError::permanent(format!("{} is not a valid document: {e}", path.display()))
        })
    }

    async fn write_document(&self, document: &Document) -> Result<PathBuf, ProviderError> {
        let path = self.document_path(&document.id);
        let io_err = |e: std::io::Error| ProviderError::from_io(&format!("writing {}", path.display()), &e);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = serde_json::to_vec_pretty(document)
            .map_err(|e| ProviderError::permanent(format!("cannot encode {}: {e}", document.id)))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(&content).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        fs::rename(&temp_path, &path).await.map_err(io_err)?;

        Ok(path)
    }

    fn state_of(&self, document: Document) -> ProviderState {
        let path = self.document_path(&document.id);
        let outputs = BTreeMap::from([
            (String::from("uid"), Value::String(document.uid)),
            (String::from("path"), Value::String(path.display().to_string())),
            (String::from("checksum"), Value::String(checksum(&document.attributes))),
        ]);

        ProviderState {
            attributes: document.attributes,
            outputs,
        }
    }
}

fn checksum(attributes: &BTreeMap<String, Value>) -> String {
    let encoded = serde_json::to_vec(attributes).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn probe(&self, id: &ResourceId) -> Result<Option<ProviderState>, ProviderError> {
        Ok(self.read_document(id).await?.map(|doc| self.state_of(doc)))
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ProviderState, ProviderError> {
        match request.operation {
            Operation::Create | Operation::Update => {
                // Keep the uid stable across updates and re-creates of a known resource
                let uid = match self.read_document(&request.id).await? {
                    Some(existing) => existing.uid,
                    None => request
                        .previous_outputs
                        .get("uid")
                        .and_then(Value::as_str)
                        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string),
                };

                let document = Document {
                    id: request.id.clone(),
                    uid,
                    attributes: request.attributes.clone(),
                };
                let path = self.write_document(&document).await?;
                debug!("{} {} at {}", request.operation, request.id, path.display());

                Ok(self.state_of(document))
            }
            Operation::Delete => {
                let path = self.document_path(&request.id);
                match fs::remove_file(&path).await {
                    Ok(()) => debug!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("{} already absent", request.id);
                    }
                    Err(e) => {
                        return Err(ProviderError::from_io(&format!("removing {}", path.display()), &e));
                    }
                }
                Ok(ProviderState::default())
            }
        }
    }
}
