use serde::{Deserialize, Serialize};
use crate::source::Record;

/// A playable entry of the feed, normalized from a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub video_url: String,
    pub thumbnail_url: String,
}

impl VideoItem {
    /// Build an item from a record. Missing fields become empty strings;
    /// only the first attachment is considered.
    pub fn from_record(record: Record) -> Self {
        let Record { id, fields } = record;
        let attachment = fields.attachment.into_iter().next();

        let (video_url, thumbnail_url) = match attachment {
            Some(attachment) => {
                let thumbnail_url = attachment.thumbnails
                    .and_then(|t| t.large)
                    .map(|large| large.url)
                    .unwrap_or_default();
                (attachment.url, thumbnail_url)
            }
            None => (String::new(), String::new()),
        };

        Self {
            id,
            title: fields.title.unwrap_or_default(),
            description: fields.description.unwrap_or_default(),
            video_url,
            thumbnail_url,
        }
    }

    /// File extension of the video URL, ignoring any query string or fragment.
    pub fn video_format(&self) -> Option<String> {
        let path = self.video_url
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or("");
        let file_name = path.rsplit('/').next().unwrap_or("");
        let (_, ext) = file_name.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_lowercase())
        }
    }
}
