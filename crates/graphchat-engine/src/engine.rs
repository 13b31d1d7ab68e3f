use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use graphchat_contracts::events::{EventLog, EventPayload};
use graphchat_contracts::session::{
    self, is_supported_upload, DuplicatePolicy, LoadReport, Role, SessionError, SessionStore,
    SnapshotOptions, UploadedImage, SESSION_DATA_DIR, SESSION_DATA_FILE,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gateway::{AnalysisGateway, AnalysisReply, AnalysisRequest};
use crate::provider::{
    api_key_from_env, model_from_env, GeminiProvider, TransportSettings, VisionProvider,
};
use crate::{json_object, push_unique_warning};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub model: String,
    /// Used only when the saved session has no credential.
    pub credential: Option<String>,
    pub snapshot: SnapshotOptions,
    pub dedup: DuplicatePolicy,
    pub transport: TransportSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(SESSION_DATA_DIR),
            model: model_from_env(),
            credential: api_key_from_env(),
            snapshot: SnapshotOptions::default(),
            dedup: DuplicatePolicy::default(),
            transport: TransportSettings::from_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Added { id: String, name: String },
    Duplicate { name: String },
    Unsupported { name: String },
    Invalid { name: String, reason: String },
}

impl UploadOutcome {
    fn kind(&self) -> &'static str {
        match self {
            UploadOutcome::Added { .. } => "added",
            UploadOutcome::Duplicate { .. } => "duplicate",
            UploadOutcome::Unsupported { .. } => "unsupported",
            UploadOutcome::Invalid { .. } => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskOutcome {
    Answered { image_id: String, reply: AnalysisReply },
    CredentialMissing,
    ImageUnavailable { image_id: String },
}

/// Runs interaction cycles over one session: mutate the store, call the
/// model, persist.
pub struct ChartChatEngine {
    snapshot_path: PathBuf,
    snapshot_options: SnapshotOptions,
    store: SessionStore,
    gateway: AnalysisGateway,
    events: EventLog,
    warnings: Vec<String>,
}

impl ChartChatEngine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let provider = GeminiProvider::new(config.transport.clone());
        Self::with_provider(config, Box::new(provider))
    }

    pub fn with_provider(config: EngineConfig, provider: Box<dyn VisionProvider>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
        let snapshot_path = config.data_dir.join(SESSION_DATA_FILE);
        let events = EventLog::new(&config.data_dir, Uuid::new_v4().to_string());
        let LoadReport { session, issue } = session::load(&snapshot_path, config.snapshot);

        let mut engine = Self {
            snapshot_path,
            snapshot_options: config.snapshot,
            store: SessionStore::new(session, config.dedup),
            gateway: AnalysisGateway::new(provider, config.model),
            events,
            warnings: Vec::new(),
        };

        if let Some(issue) = issue {
            push_unique_warning(&mut engine.warnings, issue.message());
            engine.record(
                "snapshot_issue",
                json_object(json!({
                    "kind": issue.kind(),
                    "message": issue.message(),
                })),
            );
        }
        if engine.store.credential().is_none() && config.credential.is_some() {
            engine.store.set_credential(config.credential);
        }
        engine.record(
            "session_opened",
            json_object(json!({
                "data_dir": config.data_dir.to_string_lossy().to_string(),
                "images": engine.store.len(),
                "credential_set": engine.store.credential().is_some(),
                "model": engine.gateway.model(),
                "provider": engine.gateway.provider_name(),
                "dedup": engine.store.policy().label(),
            })),
        );
        Ok(engine)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn images(&self) -> Vec<&UploadedImage> {
        self.store.list_images()
    }

    pub fn resolve(&self, selector: &str) -> Option<String> {
        self.store.resolve(selector)
    }

    pub fn model(&self) -> &str {
        self.gateway.model()
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn events_path(&self) -> &Path {
        self.events.path()
    }

    /// Warnings collected since the last call, oldest first.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn credential_set(&self) -> bool {
        self.store.credential().is_some()
    }

    /// Blank values are refused and leave the current credential in place.
    pub fn set_credential(&mut self, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        self.store.set_credential(Some(value.to_string()));
        self.record("credential_changed", json_object(json!({ "set": true })));
        true
    }

    pub fn clear_credential(&mut self) {
        self.store.set_credential(None);
        self.record("credential_changed", json_object(json!({ "set": false })));
    }

    pub fn upload_path(&mut self, path: &Path) -> Result<UploadOutcome> {
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        if !is_supported_upload(&name) {
            let outcome = UploadOutcome::Unsupported { name };
            self.record_upload(&outcome);
            return Ok(outcome);
        }
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(self.upload_bytes(&name, bytes))
    }

    pub fn upload_bytes(&mut self, name: &str, bytes: Vec<u8>) -> UploadOutcome {
        let outcome = if !is_supported_upload(name) {
            UploadOutcome::Unsupported {
                name: name.to_string(),
            }
        } else {
            let size = bytes.len() as u64;
            match self.store.add_image(name, size, bytes) {
                Ok(id) => UploadOutcome::Added {
                    id,
                    name: name.to_string(),
                },
                Err(SessionError::DuplicateUpload { name, .. }) => UploadOutcome::Duplicate { name },
                Err(SessionError::InvalidImage { name, reason }) => {
                    UploadOutcome::Invalid { name, reason }
                }
                Err(SessionError::UnknownImage(_)) => UploadOutcome::Invalid {
                    name: name.to_string(),
                    reason: "image vanished during upload".to_string(),
                },
            }
        };
        self.record_upload(&outcome);
        outcome
    }

    /// Unknown selectors are a no-op.
    pub fn remove(&mut self, selector: &str) -> Option<UploadedImage> {
        let id = self.store.resolve(selector)?;
        let removed = self.store.remove_image(&id)?;
        self.record(
            "image_removed",
            json_object(json!({
                "image_id": removed.id,
                "name": removed.name,
            })),
        );
        Some(removed)
    }

    pub fn ask(
        &mut self,
        selector: &str,
        request: AnalysisRequest,
    ) -> Result<AskOutcome, SessionError> {
        let id = self
            .store
            .resolve(selector)
            .ok_or_else(|| SessionError::UnknownImage(selector.to_string()))?;
        if !self.credential_set() {
            return Ok(AskOutcome::CredentialMissing);
        }
        if let Err(err) = self.store.decoded_image(&id) {
            push_unique_warning(&mut self.warnings, err.to_string());
            return Ok(AskOutcome::ImageUnavailable { image_id: id });
        }

        self.store
            .append_message(&id, Role::User, request.transcript_text())?;
        let started = Instant::now();
        let reply = {
            let image = self
                .store
                .image(&id)
                .ok_or_else(|| SessionError::UnknownImage(id.clone()))?;
            self.gateway
                .analyze_detailed(self.store.credential(), image, &request)
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        self.store
            .append_message(&id, Role::Model, reply.text.clone())?;

        self.record(
            "analysis_completed",
            json_object(json!({
                "image_id": id,
                "request": request.kind(),
                "outcome": reply.kind.as_str(),
                "latency_ms": latency_ms,
            })),
        );
        Ok(AskOutcome::Answered {
            image_id: id,
            reply,
        })
    }

    /// Overwrites the snapshot with the full in-memory session. On failure
    /// the in-memory state is untouched.
    pub fn persist(&mut self) -> Result<()> {
        match session::save(&self.snapshot_path, self.store.session(), self.snapshot_options) {
            Ok(()) => {
                self.record(
                    "snapshot_saved",
                    json_object(json!({
                        "path": self.snapshot_path.to_string_lossy().to_string(),
                        "images": self.store.len(),
                    })),
                );
                Ok(())
            }
            Err(err) => {
                self.record(
                    "snapshot_save_failed",
                    json_object(json!({ "error": format!("{err:#}") })),
                );
                Err(err.context("failed to save session"))
            }
        }
    }

    fn record_upload(&mut self, outcome: &UploadOutcome) {
        let payload = match outcome {
            UploadOutcome::Added { id, name } => json!({
                "image_id": id,
                "name": name,
            }),
            UploadOutcome::Invalid { name, reason } => json!({
                "name": name,
                "reason": reason,
            }),
            UploadOutcome::Duplicate { name } | UploadOutcome::Unsupported { name } => {
                json!({ "name": name })
            }
        };
        let mut payload = json_object(payload);
        payload.insert(
            "outcome".to_string(),
            Value::String(outcome.kind().to_string()),
        );
        let event_type = if matches!(outcome, UploadOutcome::Added { .. }) {
            "image_added"
        } else {
            "image_rejected"
        };
        self.record(event_type, payload);
    }

    /// Event log failures are surfaced as warnings and never end the cycle.
    fn record(&mut self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.record(event_type, payload) {
            push_unique_warning(
                &mut self.warnings,
                format!("event log write failed: {err:#}"),
            );
        }
    }
}
