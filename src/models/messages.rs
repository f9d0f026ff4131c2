use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StoryId = i64;
pub type UserId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRefMessage {
    pub block_id: String,
    pub story_id: StoryId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBlockMessage {
    pub block_id: String,
    pub content: String,
    pub story_id: StoryId,
}

/// Whole-story edit. `user_id` and `username` are what the client claims;
/// the connection identity is what gets recorded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStoryContentMessage {
    pub story_id: StoryId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub story_id: StoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoryRefMessage {
    pub story_id: StoryId,
}

/// Frames a client may send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceivedMessage {
    Ping,
    JoinStory(StoryRefMessage),
    LeaveStory(StoryRefMessage),
    LockBlock(BlockRefMessage),
    UnlockBlock(BlockRefMessage),
    UpdateBlock(UpdateBlockMessage),
    UpdateStoryContent(UpdateStoryContentMessage),
    Typing(TypingMessage),
    StopTyping(TypingMessage),
}

impl ReceivedMessage {
    /// Story the frame is scoped to, if any.
    pub fn story_id(&self) -> Option<StoryId> {
        match self {
            ReceivedMessage::Ping => None,
            ReceivedMessage::JoinStory(m) | ReceivedMessage::LeaveStory(m) => Some(m.story_id),
            ReceivedMessage::LockBlock(m) | ReceivedMessage::UnlockBlock(m) => Some(m.story_id),
            ReceivedMessage::UpdateBlock(m) => Some(m.story_id),
            ReceivedMessage::UpdateStoryContent(m) => Some(m.story_id),
            ReceivedMessage::Typing(m) | ReceivedMessage::StopTyping(m) => Some(m.story_id),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockView {
    pub block_id: String,
    pub user_id: UserId,
    pub username: String,
    pub locked_at: DateTime<Utc>,
}

/// Frames the server emits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SendMessage {
    Connected {
        user_id: UserId,
        username: String,
    },
    StoryState {
        story_id: StoryId,
        locks: Vec<LockView>,
        typing: Vec<String>,
    },
    LockBlock {
        block_id: String,
        story_id: StoryId,
        user_id: UserId,
        username: String,
    },
    UnlockBlock {
        block_id: String,
        story_id: StoryId,
    },
    UpdateBlock {
        block_id: String,
        story_id: StoryId,
        content: String,
        user_id: UserId,
        username: String,
        last_edited_at: DateTime<Utc>,
    },
    StoryContentUpdated {
        story_id: StoryId,
        content: String,
        last_edited_at: DateTime<Utc>,
        user_id: UserId,
        username: String,
        #[serde(rename = "last_edited_by_name")]
        last_edited_by_name: String,
    },
    Typing {
        story_id: StoryId,
        username: String,
    },
    StopTyping {
        story_id: StoryId,
        username: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl SendMessage {
    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        SendMessage::Error {
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_frames() {
        let msg: ReceivedMessage =
            serde_json::from_str(r#"{"type":"lock_block","blockId":"b1","storyId":42}"#).unwrap();
        assert_eq!(
            msg,
            ReceivedMessage::LockBlock(BlockRefMessage { block_id: "b1".into(), story_id: 42 })
        );
        assert_eq!(msg.story_id(), Some(42));

        let msg: ReceivedMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ReceivedMessage::Ping);
        assert_eq!(msg.story_id(), None);

        let msg: ReceivedMessage = serde_json::from_str(
            r#"{"type":"update_story_content","storyId":7,"content":"Once upon a time","userId":1,"username":"ann"}"#,
        )
        .unwrap();
        match msg {
            ReceivedMessage::UpdateStoryContent(m) => {
                assert_eq!(m.content, "Once upon a time");
                assert_eq!(m.user_id, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_frames_missing_required_fields() {
        assert!(serde_json::from_str::<ReceivedMessage>(r#"{"type":"lock_block","storyId":1}"#).is_err());
        assert!(serde_json::from_str::<ReceivedMessage>(r#"{"type":"update_block","blockId":"b","storyId":1}"#).is_err());
        assert!(serde_json::from_str::<ReceivedMessage>(r#"{"type":"teleport"}"#).is_err());
        assert!(serde_json::from_str::<ReceivedMessage>("not json").is_err());
    }

    #[test]
    fn server_frames_use_wire_field_names() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let value = serde_json::to_value(SendMessage::StoryContentUpdated {
            story_id: 7,
            content: "x".into(),
            last_edited_at: at,
            user_id: 3,
            username: "ann".into(),
            last_edited_by_name: "Ann".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "story_content_updated",
                "storyId": 7,
                "content": "x",
                "lastEditedAt": "2024-01-01T00:00:00Z",
                "userId": 3,
                "username": "ann",
                "last_edited_by_name": "Ann",
            })
        );

        let value = serde_json::to_value(SendMessage::error("Missing storyId or content", None)).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "Missing storyId or content"}));
    }
}
