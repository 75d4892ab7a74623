//! # Index Uploader
//!
//! Pushes finished Markdown files to a document-index service. The remote
//! knowledge base is created on first use and its id, together with the set
//! of uploaded files, is kept in a local JSON state file so later runs reuse
//! both. Per-file failures are collected; they never abort a directory upload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use reqwest::blocking::{Client, RequestBuilder, Response, multipart};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, IndexConfig};
use crate::constants::{INDEX_CHUNK_METHOD, INDEX_EMBEDDING_MODEL, UPLOAD_TIMEOUT_SECS};

pub const ALREADY_UPLOADED: &str = "already uploaded";
pub const UPLOADED: &str = "uploaded";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("index service is not configured (missing endpoint or api key)")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("index service returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("index service response lacks `{0}`")]
    MissingField(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadState {
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
    /// Local path -> remote file id.
    #[serde(default)]
    pub processed_files: BTreeMap<String, String>,
    #[serde(default)]
    pub last_update: Option<String>,
}

impl UploadState {
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!("ignoring unreadable upload state {}: {err}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn save(&mut self, path: &Path) -> Result<(), UploadError> {
        self.last_update = Some(Local::now().to_rfc3339());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| UploadError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub success: bool,
    pub message: String,
}

pub struct IndexUploader {
    client: Client,
    endpoint: String,
    api_key: String,
    dataset_name: String,
    state_path: PathBuf,
    state: Mutex<UploadState>,
}

impl IndexUploader {
    pub fn new(index: &IndexConfig, timeout: Duration) -> Result<Self, UploadError> {
        let endpoint = index.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() || index.api_key.trim().is_empty() {
            return Err(UploadError::NotConfigured);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key: index.api_key.trim().to_string(),
            dataset_name: index.dataset_name.clone(),
            state: Mutex::new(UploadState::load(&index.state_path)),
            state_path: index.state_path.clone(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, UploadError> {
        Self::new(&cfg.index, Duration::from_secs(UPLOAD_TIMEOUT_SECS))
    }

    fn state(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn knowledge_base_id(&self) -> Option<String> {
        self.state().knowledge_base_id.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/knowledge-bases{path}", self.endpoint)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.api_key)
    }

    /// The remote knowledge base id, creating and configuring it on first use.
    pub fn ensure_knowledge_base(&self) -> Result<String, UploadError> {
        if let Some(id) = self.knowledge_base_id() {
            return Ok(id);
        }
        let created = send_json(
            self.authed(self.client.post(self.url("")))
                .json(&json!({ "name": self.dataset_name })),
        )?;
        let id = id_field(&created)?;
        send_json(
            self.authed(self.client.post(self.url(&format!("/{id}/config"))))
                .json(&json!({
                    "embedding_model": INDEX_EMBEDDING_MODEL,
                    "chunk_method": INDEX_CHUNK_METHOD,
                })),
        )?;
        info!("created knowledge base {id} ({})", self.dataset_name);

        let mut state = self.state();
        state.knowledge_base_id = Some(id.clone());
        state.save(&self.state_path)?;
        Ok(id)
    }

    /// Upload one file and start its parsing; already uploaded files are skipped.
    pub fn upload_file(&self, path: &Path) -> UploadOutcome {
        let key = path.to_string_lossy().to_string();
        if self.state().processed_files.contains_key(&key) {
            return UploadOutcome {
                path: path.to_path_buf(),
                success: true,
                message: ALREADY_UPLOADED.to_string(),
            };
        }
        match self.try_upload(path, key) {
            Ok(file_id) => {
                debug!("uploaded {} as {file_id}", path.display());
                UploadOutcome {
                    path: path.to_path_buf(),
                    success: true,
                    message: UPLOADED.to_string(),
                }
            }
            Err(err) => {
                warn!("upload failed for {}: {err}", path.display());
                UploadOutcome {
                    path: path.to_path_buf(),
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }

    fn try_upload(&self, path: &Path, key: String) -> Result<String, UploadError> {
        let kb = self.ensure_knowledge_base()?;
        let bytes = std::fs::read(path).map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "page.md".to_string());
        let part = multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("text/markdown")?;
        let form = multipart::Form::new().part("file", part);

        let uploaded = send_json(
            self.authed(self.client.post(self.url(&format!("/{kb}/files"))))
                .multipart(form),
        )?;
        let file_id = id_field(&uploaded)?;
        send_json(self.authed(
            self.client
                .post(self.url(&format!("/{kb}/files/{file_id}/parse"))),
        ))?;

        let mut state = self.state();
        state.processed_files.insert(key, file_id.clone());
        state.save(&self.state_path)?;
        Ok(file_id)
    }

    pub fn upload_files(&self, paths: &[PathBuf]) -> Vec<UploadOutcome> {
        paths.iter().map(|p| self.upload_file(p)).collect()
    }

    /// Upload every `*.md` file directly under `dir`, in name order.
    pub fn upload_directory(&self, dir: &Path) -> Vec<UploadOutcome> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list {}: {err}", dir.display());
                return Vec::new();
            }
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        files.sort();
        self.upload_files(&files)
    }

    /// Processing status of a remote file, as reported by the service.
    pub fn file_status(&self, file_id: &str) -> Result<Value, UploadError> {
        let kb = self.ensure_knowledge_base()?;
        send_json(self.authed(
            self.client
                .get(self.url(&format!("/{kb}/files/{file_id}"))),
        ))
    }
}

fn send_json(request: RequestBuilder) -> Result<Value, UploadError> {
    let response: Response = request.send()?;
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(UploadError::Api {
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

fn id_field(value: &Value) -> Result<String, UploadError> {
    let id = value.get("id").or_else(|| value.pointer("/data/id"));
    match id {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(UploadError::MissingField("id")),
    }
}
