//! Chat messages exchanged with providers.
//!
//! Content is either plain text or an ordered list of typed parts (text and
//! data-URI images). Tool results travel as `user`-role messages for broad
//! provider compatibility; the `tool` role exists for providers that accept
//! it natively.

use serde::{Deserialize, Serialize};

/// Message role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One typed part of a multimodal message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// `image_url` is a `data:<media>;base64,<payload>` URI.
    ImageUrl { image_url: String },
}

/// Message content: plain text, or an ordered list of parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts (the whole string for `Text`).
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }

    /// Character count of the text portion (token estimation input).
    pub fn text_len(&self) -> usize {
        match self {
            MessageContent::Text(s) => s.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

/// One conversation message as sent to a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Plain text view of the content.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: text() flattens parts, skipping images.
    #[test]
    fn text_flattens_parts() {
        let msg = ChatMessage::user_parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ImageUrl {
                image_url: "data:image/png;base64,xxxx".into(),
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(msg.text(), "ab");
        assert_eq!(msg.content.text_len(), 2);
    }

    /// **Scenario**: roles parse from their wire names and reject unknowns.
    #[test]
    fn role_round_trip() {
        for r in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(r.as_str().parse::<Role>().unwrap(), r);
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    /// **Scenario**: plain-text content serializes as a bare JSON string,
    /// parts as an array (untagged).
    #[test]
    fn content_serde_shapes() {
        let text = MessageContent::Text("hi".into());
        assert_eq!(serde_json::to_value(&text).unwrap(), serde_json::json!("hi"));

        let parts = MessageContent::Parts(vec![ContentPart::Text { text: "hi".into() }]);
        let v = serde_json::to_value(&parts).unwrap();
        assert_eq!(v[0]["type"], "text");
        assert_eq!(v[0]["text"], "hi");

        let back: MessageContent = serde_json::from_value(v).unwrap();
        assert_eq!(back, parts);
    }
}
