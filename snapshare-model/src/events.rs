use crate::ids::{MediaId, RoomId};
use crate::media::MediaItem;

/// Change-feed payloads pushed for a room's media.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum RoomMediaEvent {
    Inserted {
        item: MediaItem,
    },
    Deleted {
        room_id: RoomId,
        id: MediaId,
        /// Display name of whoever removed the item, when the feed knows it.
        #[cfg_attr(
            feature = "serde",
            serde(default, skip_serializing_if = "Option::is_none")
        )]
        deleted_by: Option<String>,
    },
}

impl RoomMediaEvent {
    pub fn room_id(&self) -> RoomId {
        match self {
            RoomMediaEvent::Inserted { item } => item.room_id,
            RoomMediaEvent::Deleted { room_id, .. } => *room_id,
        }
    }

    pub fn media_id(&self) -> MediaId {
        match self {
            RoomMediaEvent::Inserted { item } => item.id,
            RoomMediaEvent::Deleted { id, .. } => *id,
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;
    use crate::media::NewMediaItem;

    #[test]
    fn deleted_event_uses_tagged_wire_shape() {
        let room_id = RoomId::new();
        let id = NewMediaItem::new(room_id, "https://b.test/1.jpg", "kim")
            .persisted(MediaId::generate(), chrono::Utc::now())
            .id;
        let event = RoomMediaEvent::Deleted {
            room_id,
            id,
            deleted_by: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deleted");
        assert!(json.get("deleted_by").is_none());
        let back: RoomMediaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
