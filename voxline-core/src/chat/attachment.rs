//! Files and images attached to a user message.

use serde::{Deserialize, Serialize};

use crate::remote::wire::{Blob, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Sent to the model as inline binary data.
    Image,
    /// Read as text and appended to the message.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAttachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub name: String,
    /// Base64 (bare or as a `data:` URL) for images, raw text for files.
    pub data: String,
    pub mime_type: String,
}

impl ChatAttachment {
    pub fn image(name: impl Into<String>, data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            name: name.into(),
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn file(name: impl Into<String>, text: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::File,
            name: name.into(),
            data: text.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Image payload with any `data:<mime>;base64,` prefix removed.
    fn base64_payload(&self) -> &str {
        self.data
            .split_once(',')
            .map_or(self.data.as_str(), |(_, payload)| payload)
    }
}

/// Content parts for one user turn: the text first, then an inline image.
///
/// A file attachment is not a separate part; its text is appended to the
/// message under a `[File Attached: <name>]` header.
pub fn message_parts(text: &str, attachment: Option<&ChatAttachment>) -> Vec<Part> {
    let mut text = text.to_string();
    let mut image = None;

    match attachment {
        Some(a) if a.kind == AttachmentKind::Image => {
            image = Some(Part {
                text: None,
                inline_data: Some(Blob {
                    mime_type: a.mime_type.clone(),
                    data: a.base64_payload().to_string(),
                }),
            });
        }
        Some(a) => {
            text.push_str(&format!("\n\n[File Attached: {}]\nContent:\n{}", a.name, a.data));
        }
        None => {}
    }

    let mut parts = vec![Part {
        text: Some(text),
        inline_data: None,
    }];
    parts.extend(image);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_becomes_inline_data_without_url_prefix() {
        let photo = ChatAttachment::image("cat.png", "data:image/png;base64,iVBORw0K", "image/png");
        let parts = message_parts("what is this?", Some(&photo));

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].text.as_deref(), Some("what is this?"));
        let blob = parts[1].inline_data.as_ref().unwrap();
        assert_eq!(blob.data, "iVBORw0K");
        assert_eq!(blob.mime_type, "image/png");
    }

    #[test]
    fn bare_base64_image_is_sent_as_is() {
        let photo = ChatAttachment::image("cat.jpg", "/9j/4AAQ", "image/jpeg");
        let parts = message_parts("", Some(&photo));
        assert_eq!(parts[1].inline_data.as_ref().unwrap().data, "/9j/4AAQ");
    }

    #[test]
    fn file_text_is_appended_to_the_message() {
        let notes = ChatAttachment::file("notes.txt", "buy eggs", "text/plain");
        let parts = message_parts("summarise", Some(&notes));

        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0].text.as_deref(),
            Some("summarise\n\n[File Attached: notes.txt]\nContent:\nbuy eggs")
        );
    }

    #[test]
    fn kind_serializes_under_type_key() {
        let json = serde_json::to_value(ChatAttachment::file("a.md", "#", "text/markdown")).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["mimeType"], "text/markdown");
    }
}
