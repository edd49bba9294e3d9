//! Track metadata carried alongside the decoded stream.

use serde::{Deserialize, Serialize};

/// Descriptive tags of a loaded track. Absent tags are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub comment: String,
    pub year: String,
    pub genre: String,
    pub track_number: String,
}

impl TrackMetadata {
    /// Display name: title when present, otherwise `fallback`.
    pub fn display_title<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.title.is_empty() {
            fallback
        } else {
            &self.title
        }
    }

    /// Track number parsed as an integer, if it is one.
    pub fn track_number(&self) -> Option<u32> {
        self.track_number.trim().parse().ok()
    }
}
