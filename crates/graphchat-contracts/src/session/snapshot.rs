use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{decode_payload, ChatMessage, Session, UploadedImage};

pub const SESSION_DATA_DIR: &str = "session_data";
pub const SESSION_DATA_FILE: &str = "session_data.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatLogPersistence {
    /// Chat history lives in memory only and is lost on restart.
    #[default]
    Omit,
    Persist,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub chat_log: ChatLogPersistence,
}

/// Why a snapshot load fell back to an empty session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotIssue {
    /// The file exists but is not a valid snapshot document.
    Malformed(String),
    /// The file could not be read at all.
    Unreadable(String),
}

impl SnapshotIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotIssue::Malformed(_) => "malformed",
            SnapshotIssue::Unreadable(_) => "unreadable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SnapshotIssue::Malformed(reason) => {
                format!("Saved session was malformed and has been reset: {reason}")
            }
            SnapshotIssue::Unreadable(reason) => {
                format!("Saved session could not be read: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub session: Session,
    pub issue: Option<SnapshotIssue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    app_api_key: Option<String>,
    #[serde(default)]
    app_uploaded_images: IndexMap<String, SnapshotImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    id: String,
    name: String,
    size: u64,
    #[serde(default)]
    bytes_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat_log: Option<Vec<ChatMessage>>,
}

/// Serializes a session to the snapshot JSON document.
///
/// Payloads are written as arrays of integers; decoded handles are dropped.
/// Output is compact: a pretty printer would put every byte on its own line.
pub fn encode(session: &Session, options: SnapshotOptions) -> anyhow::Result<Vec<u8>> {
    let document = SnapshotDocument {
        app_api_key: session.credential.clone(),
        app_uploaded_images: session
            .images
            .iter()
            .map(|(key, image)| {
                (
                    key.clone(),
                    SnapshotImage {
                        id: image.id.clone(),
                        name: image.name.clone(),
                        size: image.size,
                        bytes_data: Some(image.bytes.clone()),
                        chat_log: match options.chat_log {
                            ChatLogPersistence::Persist => Some(image.chat_log.clone()),
                            ChatLogPersistence::Omit => None,
                        },
                    },
                )
            })
            .collect(),
    };
    Ok(serde_json::to_vec(&document)?)
}

/// Parses a snapshot document. Entries whose payload is missing or does not
/// decode are kept without a decoded handle.
pub fn decode(raw: &[u8], options: SnapshotOptions) -> anyhow::Result<Session> {
    let document: SnapshotDocument =
        serde_json::from_slice(raw).context("invalid session snapshot")?;

    let mut session = Session {
        credential: document.app_api_key,
        images: IndexMap::with_capacity(document.app_uploaded_images.len()),
    };
    for (key, entry) in document.app_uploaded_images {
        let bytes = entry.bytes_data.unwrap_or_default();
        let decoded = if bytes.is_empty() {
            None
        } else {
            decode_payload(&bytes).ok().map(|(image, _)| image)
        };
        let chat_log = match options.chat_log {
            ChatLogPersistence::Persist => entry.chat_log.unwrap_or_default(),
            ChatLogPersistence::Omit => Vec::new(),
        };
        let id = if entry.id.is_empty() { key.clone() } else { entry.id };
        session.images.insert(
            key,
            UploadedImage {
                id,
                name: entry.name,
                size: entry.size,
                bytes,
                decoded,
                chat_log,
            },
        );
    }
    Ok(session)
}

/// Loads the snapshot at `path`. Never fails: a missing file is an empty
/// session, anything else that goes wrong is reported in `issue`.
pub fn load(path: &Path, options: SnapshotOptions) -> LoadReport {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return LoadReport::default(),
        Err(err) => {
            return LoadReport {
                session: Session::default(),
                issue: Some(SnapshotIssue::Unreadable(format!(
                    "{}: {err}",
                    path.display()
                ))),
            }
        }
    };

    match decode(&raw, options) {
        Ok(session) => LoadReport {
            session,
            issue: None,
        },
        Err(err) => LoadReport {
            session: Session::default(),
            issue: Some(SnapshotIssue::Malformed(format!("{err:#}"))),
        },
    }
}

/// Writes the whole snapshot, replacing the previous file atomically.
pub fn save(path: &Path, session: &Session, options: SnapshotOptions) -> anyhow::Result<()> {
    let encoded = encode(session, options)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage snapshot in {}", parent.display()))?;
    staged.write_all(&encoded)?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::super::test_support::png_bytes;
    use super::super::{DuplicatePolicy, Role, SessionStore};
    use super::*;

    fn populated_store() -> anyhow::Result<(SessionStore, String)> {
        let mut store = SessionStore::new(Session::default(), DuplicatePolicy::NameAndSize);
        store.set_credential(Some("key-abc".to_string()));
        let id = store.add_image("chart.png", 500, png_bytes(3, 3, 20))?;
        store.add_image("bars.png", 42, png_bytes(4, 2, 90))?;
        store.append_message(&id, Role::User, "What's the peak value?")?;
        store.append_message(&id, Role::Model, "About 12.")?;
        Ok((store, id))
    }

    #[test]
    fn round_trip_restores_images_and_credential() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_DIR).join(SESSION_DATA_FILE);
        let (store, _) = populated_store()?;

        save(&path, store.session(), SnapshotOptions::default())?;
        let report = load(&path, SnapshotOptions::default());

        assert_eq!(report.issue, None);
        assert_eq!(report.session.credential.as_deref(), Some("key-abc"));
        let original: Vec<_> = store.list_images();
        let restored: Vec<_> = report.session.images.values().collect();
        assert_eq!(original.len(), restored.len());
        for (before, after) in original.iter().zip(restored.iter()) {
            assert_eq!(before.id, after.id);
            assert_eq!(before.name, after.name);
            assert_eq!(before.size, after.size);
            assert_eq!(before.bytes, after.bytes);
            assert!(after.decoded.is_some());
        }
        Ok(())
    }

    #[test]
    fn document_uses_integer_byte_arrays_and_no_chat_log_by_default() -> anyhow::Result<()> {
        let mut session = Session::default();
        session.images.insert(
            "img-1".to_string(),
            UploadedImage {
                id: "img-1".to_string(),
                name: "raw.png".to_string(),
                size: 3,
                bytes: vec![1, 2, 3],
                decoded: None,
                chat_log: vec![ChatMessage::new(Role::User, "hi")],
            },
        );

        let parsed: Value = serde_json::from_slice(&encode(&session, SnapshotOptions::default())?)?;
        assert_eq!(
            parsed,
            json!({
                "app_api_key": null,
                "app_uploaded_images": {
                    "img-1": {
                        "id": "img-1",
                        "name": "raw.png",
                        "size": 3,
                        "bytes_data": [1, 2, 3]
                    }
                }
            })
        );
        Ok(())
    }

    #[test]
    fn encoded_snapshot_is_compact() -> anyhow::Result<()> {
        let payload = vec![200u8; 4096];
        let mut session = Session::default();
        session.images.insert(
            "img-1".to_string(),
            UploadedImage {
                id: "img-1".to_string(),
                name: "big.png".to_string(),
                size: payload.len() as u64,
                bytes: payload.clone(),
                decoded: None,
                chat_log: Vec::new(),
            },
        );

        let encoded = encode(&session, SnapshotOptions::default())?;
        assert!(!encoded.contains(&b'\n'));
        // "200," per byte plus a small fixed envelope.
        assert!(encoded.len() < payload.len() * 4 + 200);
        Ok(())
    }

    #[test]
    fn raw_payload_survives_reload_without_decoding() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_FILE);
        let mut session = Session::default();
        session.images.insert(
            "img-1".to_string(),
            UploadedImage {
                id: "img-1".to_string(),
                name: "raw.png".to_string(),
                size: 3,
                bytes: b"\x01\x02\x03".to_vec(),
                decoded: None,
                chat_log: Vec::new(),
            },
        );
        save(&path, &session, SnapshotOptions::default())?;

        let stored: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(
            stored["app_uploaded_images"]["img-1"]["bytes_data"],
            json!([1, 2, 3])
        );

        let report = load(&path, SnapshotOptions::default());
        let image = report
            .session
            .images
            .get("img-1")
            .ok_or_else(|| anyhow::anyhow!("image missing after reload"))?;
        assert_eq!(image.bytes, vec![1u8, 2, 3]);
        assert!(image.decoded.is_none());
        Ok(())
    }

    #[test]
    fn chat_log_is_restored_only_when_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_FILE);
        let (store, id) = populated_store()?;
        let persist = SnapshotOptions {
            chat_log: ChatLogPersistence::Persist,
        };

        save(&path, store.session(), persist)?;
        let kept = load(&path, persist);
        let log = kept
            .session
            .images
            .get(&id)
            .map(|image| image.chat_log.clone())
            .unwrap_or_default();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text(), "About 12.");

        let dropped = load(&path, SnapshotOptions::default());
        assert!(dropped
            .session
            .images
            .values()
            .all(|image| image.chat_log.is_empty()));
        Ok(())
    }

    #[test]
    fn missing_file_is_an_empty_session() {
        let report = load(
            Path::new("/definitely/not/here/session_data.json"),
            SnapshotOptions::default(),
        );
        assert!(report.session.is_empty());
        assert_eq!(report.issue, None);
    }

    #[test]
    fn truncated_file_resets_to_empty_session() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_FILE);
        std::fs::write(&path, r#"{"app_api_key": "k", "app_uploaded_images": {"a": {"id""#)?;

        let report = load(&path, SnapshotOptions::default());
        assert!(report.session.is_empty());
        assert!(matches!(report.issue, Some(SnapshotIssue::Malformed(_))));
        Ok(())
    }

    #[test]
    fn out_of_range_byte_values_are_malformed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_FILE);
        std::fs::write(
            &path,
            r#"{"app_api_key": null, "app_uploaded_images": {"a": {"id": "a", "name": "a.png", "size": 1, "bytes_data": [256]}}}"#,
        )?;

        let report = load(&path, SnapshotOptions::default());
        assert!(report.session.is_empty());
        assert_eq!(report.issue.as_ref().map(SnapshotIssue::kind), Some("malformed"));
        Ok(())
    }

    #[test]
    fn directory_in_place_of_file_is_unreadable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(SESSION_DATA_FILE);
        std::fs::create_dir_all(&path)?;

        let report = load(&path, SnapshotOptions::default());
        assert!(report.session.is_empty());
        assert!(matches!(report.issue, Some(SnapshotIssue::Unreadable(_))));
        Ok(())
    }

    #[test]
    fn entries_without_payload_have_no_handle() -> anyhow::Result<()> {
        let raw = br#"{"app_api_key": "k", "app_uploaded_images": {"a": {"id": "a", "name": "a.png", "size": 9}}}"#;
        let session = decode(raw, SnapshotOptions::default())?;
        let image = session
            .images
            .get("a")
            .ok_or_else(|| anyhow::anyhow!("entry dropped"))?;
        assert!(image.bytes.is_empty());
        assert!(image.decoded.is_none());
        Ok(())
    }

    #[test]
    fn save_overwrites_previous_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join(SESSION_DATA_FILE);
        let (mut store, id) = populated_store()?;
        save(&path, store.session(), SnapshotOptions::default())?;

        store.remove_image(&id);
        store.set_credential(None);
        save(&path, store.session(), SnapshotOptions::default())?;

        let report = load(&path, SnapshotOptions::default());
        assert_eq!(report.session.credential, None);
        assert_eq!(report.session.images.len(), 1);
        assert!(!report.session.images.contains_key(&id));
        Ok(())
    }
}
