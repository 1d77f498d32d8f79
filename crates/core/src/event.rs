// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Data and control items that travel through pads.
//!
//! - [`Buffer`]: a chunk of media payload
//! - [`Event`]: in-band control; some kinds are *sticky* and are cached on
//!   pads so they can be replayed to a new peer
//! - [`Query`]: questions asked of downstream
//! - [`StreamInfo`]: the stream identity object carried by stream-start

use crate::caps::Caps;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Media payload pushed from a source pad to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub data: Bytes,
    /// Presentation timestamp in nanoseconds.
    pub pts: Option<u64>,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), pts: None }
    }

    #[must_use]
    pub const fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of pushing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    Ok,
    NotLinked,
    /// The pad is inactive (flushing or shutting down).
    Flushing,
    Eos,
    NotNegotiated,
    Error,
}

impl FlowReturn {
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Free-form stream metadata (title, language, codec name, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList(IndexMap<String, String>);

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` into `self`; existing keys are overwritten.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

/// Coarse classification of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Unknown,
    Audio,
    Video,
    Container,
    Text,
}

impl StreamType {
    /// Best-effort classification from caps.
    pub fn from_caps(caps: &Caps) -> Self {
        match caps.media_type() {
            Some(t) if t.starts_with("video/") || t.starts_with("image/") => Self::Video,
            Some(t) if t.starts_with("audio/") => Self::Audio,
            Some(t) if t.starts_with("text/") || t.starts_with("subpicture/") => Self::Text,
            Some(t) if t.starts_with("application/") => Self::Container,
            _ => Self::Unknown,
        }
    }
}

/// Stream identity object. Shared between every stream-start event that
/// describes the same logical stream.
#[derive(Debug)]
pub struct StreamInfo {
    stream_id: String,
    stream_type: Mutex<StreamType>,
    caps: Mutex<Option<Caps>>,
    tags: Mutex<TagList>,
}

impl StreamInfo {
    pub fn new(stream_id: impl Into<String>, caps: Option<Caps>, tags: TagList) -> Self {
        let stream_type = caps.as_ref().map_or(StreamType::Unknown, StreamType::from_caps);
        Self {
            stream_id: stream_id.into(),
            stream_type: Mutex::new(stream_type),
            caps: Mutex::new(caps),
            tags: Mutex::new(tags),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_type(&self) -> StreamType {
        *self.stream_type.lock()
    }

    pub fn caps(&self) -> Option<Caps> {
        self.caps.lock().clone()
    }

    pub fn set_caps(&self, caps: Caps) {
        *self.stream_type.lock() = StreamType::from_caps(&caps);
        *self.caps.lock() = Some(caps);
    }

    pub fn tags(&self) -> TagList {
        self.tags.lock().clone()
    }

    pub fn merge_tags(&self, tags: &TagList) {
        self.tags.lock().merge(tags);
    }
}

/// Discriminant of an [`Event`]; sticky kinds are ordered as they must be
/// delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    StreamStart,
    Caps,
    Segment,
    Tag,
    Gap,
    Eos,
    FlushStart,
    FlushStop,
}

/// In-band control event travelling downstream.
#[derive(Debug, Clone)]
pub enum Event {
    StreamStart {
        stream_id: String,
        group_id: Option<u32>,
        stream: Option<Arc<StreamInfo>>,
    },
    Caps(Caps),
    Segment {
        start: u64,
    },
    Tag(TagList),
    Gap {
        pts: u64,
    },
    Eos,
    FlushStart,
    FlushStop,
}

impl Event {
    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        Self::StreamStart { stream_id: stream_id.into(), group_id: None, stream: None }
    }

    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StreamStart { .. } => EventKind::StreamStart,
            Self::Caps(_) => EventKind::Caps,
            Self::Segment { .. } => EventKind::Segment,
            Self::Tag(_) => EventKind::Tag,
            Self::Gap { .. } => EventKind::Gap,
            Self::Eos => EventKind::Eos,
            Self::FlushStart => EventKind::FlushStart,
            Self::FlushStop => EventKind::FlushStop,
        }
    }

    /// Sticky events are cached on pads and replayed to new peers.
    pub const fn is_sticky(&self) -> bool {
        matches!(
            self,
            Self::StreamStart { .. }
                | Self::Caps(_)
                | Self::Segment { .. }
                | Self::Tag(_)
                | Self::Eos
        )
    }

    /// Serialized events travel in order with buffers. Flush-start is the
    /// only out-of-band event.
    pub const fn is_serialized(&self) -> bool {
        !matches!(self, Self::FlushStart)
    }

    pub const fn caps(&self) -> Option<&Caps> {
        match self {
            Self::Caps(caps) => Some(caps),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::StreamStart { .. } => "stream-start",
            Self::Caps(_) => "caps",
            Self::Segment { .. } => "segment",
            Self::Tag(_) => "tag",
            Self::Gap { .. } => "gap",
            Self::Eos => "eos",
            Self::FlushStart => "flush-start",
            Self::FlushStop => "flush-stop",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamStart { stream_id, .. } => write!(f, "stream-start({stream_id})"),
            Self::Caps(caps) => write!(f, "caps({caps})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Downstream query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Buffer pool negotiation; serialized with data.
    Allocation { caps: Option<Caps> },
    /// Asks downstream to finish processing queued data; serialized.
    Drain,
    /// Out-of-band latency query.
    Latency,
}

impl Query {
    pub const fn is_serialized(&self) -> bool {
        matches!(self, Self::Allocation { .. } | Self::Drain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_and_serialized_classification() {
        assert!(Event::stream_start("s").is_sticky());
        assert!(Event::Caps(Caps::new_simple("audio/mpeg")).is_sticky());
        assert!(Event::Eos.is_sticky());
        assert!(!Event::Gap { pts: 0 }.is_sticky());
        assert!(!Event::FlushStart.is_serialized());
        assert!(Event::FlushStop.is_serialized());
        assert!(Query::Drain.is_serialized());
        assert!(!Query::Latency.is_serialized());
    }

    #[test]
    fn test_sticky_kind_order() {
        assert!(EventKind::StreamStart < EventKind::Caps);
        assert!(EventKind::Caps < EventKind::Segment);
        assert!(EventKind::Tag < EventKind::Eos);
    }

    #[test]
    fn test_stream_info_type_follows_caps() {
        let info = StreamInfo::new("s0", None, TagList::new());
        assert_eq!(info.stream_type(), StreamType::Unknown);
        info.set_caps(Caps::new_simple("video/x-h264"));
        assert_eq!(info.stream_type(), StreamType::Video);
        info.merge_tags(&TagList::new().with("language", "en"));
        assert_eq!(info.tags().get("language"), Some("en"));
    }
}
