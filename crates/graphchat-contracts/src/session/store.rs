use image::DynamicImage;
use uuid::Uuid;

use super::{
    decode_payload, ChatMessage, DuplicatePolicy, Role, Session, SessionError, UploadedImage,
};

/// In-memory owner of one interactive session.
///
/// The store never touches disk; callers persist at the end of each
/// interaction cycle.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    session: Session,
    policy: DuplicatePolicy,
}

impl SessionStore {
    pub fn new(session: Session, policy: DuplicatePolicy) -> Self {
        Self { session, policy }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn credential(&self) -> Option<&str> {
        self.session.credential.as_deref()
    }

    /// Blank values clear the credential.
    pub fn set_credential(&mut self, value: Option<String>) {
        self.session.credential = value
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
    }

    pub fn list_images(&self) -> Vec<&UploadedImage> {
        self.session.images.values().collect()
    }

    pub fn image(&self, id: &str) -> Option<&UploadedImage> {
        self.session.images.get(id)
    }

    pub fn len(&self) -> usize {
        self.session.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.images.is_empty()
    }

    pub fn add_image(
        &mut self,
        name: &str,
        size: u64,
        payload: Vec<u8>,
    ) -> Result<String, SessionError> {
        if self
            .policy
            .matches(self.session.images.values(), name, size, &payload)
        {
            return Err(SessionError::DuplicateUpload {
                name: name.to_string(),
                size,
            });
        }

        let (decoded, _) =
            decode_payload(&payload).map_err(|reason| SessionError::InvalidImage {
                name: name.to_string(),
                reason,
            })?;

        let mut id = Uuid::new_v4().to_string();
        while self.session.images.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        self.session.images.insert(
            id.clone(),
            UploadedImage {
                id: id.clone(),
                name: name.to_string(),
                size,
                bytes: payload,
                decoded: Some(decoded),
                chat_log: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Removing an id that is not present is a no-op.
    pub fn remove_image(&mut self, id: &str) -> Option<UploadedImage> {
        self.session.images.shift_remove(id)
    }

    pub fn append_message(
        &mut self,
        id: &str,
        role: Role,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        let image = self
            .session
            .images
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownImage(id.to_string()))?;
        image.chat_log.push(ChatMessage::new(role, text));
        Ok(())
    }

    /// Returns the decoded handle, rebuilding it from the payload if the
    /// cache is empty.
    pub fn decoded_image(&mut self, id: &str) -> Result<&DynamicImage, SessionError> {
        let image = self
            .session
            .images
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownImage(id.to_string()))?;
        if image.decoded.is_none() {
            if !image.has_payload() {
                return Err(SessionError::InvalidImage {
                    name: image.name.clone(),
                    reason: "no image data available".to_string(),
                });
            }
            let (decoded, _) =
                decode_payload(&image.bytes).map_err(|reason| SessionError::InvalidImage {
                    name: image.name.clone(),
                    reason,
                })?;
            image.decoded = Some(decoded);
        }
        image
            .decoded
            .as_ref()
            .ok_or_else(|| SessionError::UnknownImage(id.to_string()))
    }

    /// Resolves a full id, a unique id prefix, or a 1-based position in
    /// upload order.
    pub fn resolve(&self, selector: &str) -> Option<String> {
        let selector = selector.trim();
        if selector.is_empty() {
            return None;
        }
        if self.session.images.contains_key(selector) {
            return Some(selector.to_string());
        }
        if let Ok(position) = selector.parse::<usize>() {
            return position
                .checked_sub(1)
                .and_then(|index| self.session.images.get_index(index))
                .map(|(id, _)| id.clone());
        }
        let mut matches = self
            .session
            .images
            .keys()
            .filter(|id| id.starts_with(selector));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn into_session(self) -> Session {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::test_support::png_bytes;
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Session::default(), DuplicatePolicy::NameAndSize)
    }

    #[test]
    fn upload_returns_fresh_id_with_empty_history() -> anyhow::Result<()> {
        let mut store = store();
        let payload = png_bytes(4, 4, 10);
        let id = store.add_image("chart.png", 500, payload)?;

        let images = store.list_images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, id);
        assert_eq!(images[0].name, "chart.png");
        assert!(images[0].chat_log.is_empty());
        assert!(images[0].decoded.is_some());
        Ok(())
    }

    #[test]
    fn second_identical_upload_is_rejected() -> anyhow::Result<()> {
        let mut store = store();
        store.add_image("chart.png", 500, png_bytes(4, 4, 10))?;
        let second = store.add_image("chart.png", 500, png_bytes(4, 4, 10));

        assert_eq!(
            second,
            Err(SessionError::DuplicateUpload {
                name: "chart.png".to_string(),
                size: 500,
            })
        );
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn same_name_different_size_is_accepted() -> anyhow::Result<()> {
        let mut store = store();
        store.add_image("chart.png", 500, png_bytes(4, 4, 10))?;
        store.add_image("chart.png", 501, png_bytes(5, 4, 10))?;
        store.add_image("other.png", 500, png_bytes(6, 4, 10))?;
        assert_eq!(store.len(), 3);
        Ok(())
    }

    #[test]
    fn store_never_holds_two_equal_name_size_pairs() {
        let mut store = store();
        let uploads = [
            ("a.png", 10),
            ("b.png", 10),
            ("a.png", 10),
            ("a.png", 11),
            ("b.png", 10),
            ("c.png", 12),
            ("a.png", 11),
        ];
        for (idx, (name, size)) in uploads.iter().enumerate() {
            let _ = store.add_image(name, *size, png_bytes(2, 2, idx as u8));
        }

        let pairs: HashSet<(String, u64)> = store
            .list_images()
            .into_iter()
            .map(|image| (image.name.clone(), image.size))
            .collect();
        assert_eq!(pairs.len(), store.len());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn undecodable_upload_is_not_stored() {
        let mut store = store();
        let result = store.add_image("broken.png", 3, vec![1, 2, 3]);
        assert!(matches!(result, Err(SessionError::InvalidImage { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn remove_is_idempotent() -> anyhow::Result<()> {
        let mut store = store();
        let keep = store.add_image("keep.png", 1, png_bytes(2, 2, 1))?;
        let drop = store.add_image("drop.png", 2, png_bytes(2, 2, 2))?;

        assert!(store.remove_image(&drop).is_some());
        let after_once = store.session().clone();
        assert!(store.remove_image(&drop).is_none());
        assert_eq!(store.session(), &after_once);
        assert!(store.image(&keep).is_some());
        Ok(())
    }

    #[test]
    fn append_message_keeps_call_order() -> anyhow::Result<()> {
        let mut store = store();
        let id = store.add_image("chart.png", 1, png_bytes(2, 2, 1))?;
        store.append_message(&id, Role::User, "What's the peak value?")?;
        store.append_message(&id, Role::Model, "42")?;

        let log = &store.image(&id).map(|image| image.chat_log.clone()).unwrap_or_default();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], ChatMessage::new(Role::User, "What's the peak value?"));
        assert_eq!(log[1], ChatMessage::new(Role::Model, "42"));
        Ok(())
    }

    #[test]
    fn append_to_unknown_image_touches_nothing() -> anyhow::Result<()> {
        let mut store = store();
        let id = store.add_image("chart.png", 1, png_bytes(2, 2, 1))?;
        store.append_message(&id, Role::User, "hi")?;
        let before = store.session().clone();

        let result = store.append_message("missing", Role::User, "lost");
        assert_eq!(
            result,
            Err(SessionError::UnknownImage("missing".to_string()))
        );
        assert_eq!(store.session(), &before);
        Ok(())
    }

    #[test]
    fn decoded_image_is_rebuilt_lazily() -> anyhow::Result<()> {
        let mut store = store();
        let id = store.add_image("chart.png", 1, png_bytes(7, 3, 1))?;
        if let Some(image) = store.session.images.get_mut(&id) {
            image.decoded = None;
        }
        let decoded = store.decoded_image(&id)?;
        assert_eq!((decoded.width(), decoded.height()), (7, 3));
        assert!(store.image(&id).and_then(|image| image.decoded.as_ref()).is_some());
        Ok(())
    }

    #[test]
    fn blank_credential_is_absent() {
        let mut store = store();
        store.set_credential(Some("  key-123 ".to_string()));
        assert_eq!(store.credential(), Some("key-123"));
        store.set_credential(Some("   ".to_string()));
        assert_eq!(store.credential(), None);
    }

    #[test]
    fn resolve_accepts_id_prefix_and_position() -> anyhow::Result<()> {
        let mut store = store();
        let first = store.add_image("a.png", 1, png_bytes(2, 2, 1))?;
        let second = store.add_image("b.png", 2, png_bytes(2, 2, 2))?;

        assert_eq!(store.resolve(&first), Some(first.clone()));
        assert_eq!(store.resolve("2"), Some(second.clone()));
        assert_eq!(store.resolve("3"), None);
        assert_eq!(store.resolve(""), None);
        if first[..8] != second[..8] {
            assert_eq!(store.resolve(&second[..8]), Some(second.clone()));
        }
        Ok(())
    }
}
