//! Request and payload types shared by the preloader services.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The dispatch ordinal of a preload request.
///
/// Lower values are dispatched first. Priorities only order pending loads, they have no
/// influence on which cache entries get evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// The priority of requests that did not declare one.
    ///
    /// Sorts after every declared priority.
    pub const NONE: Priority = Priority(u32::MAX);

    /// Normalizes a declared priority attribute.
    ///
    /// Missing, empty, negative or non-numeric values all map to [`Priority::NONE`].
    pub fn from_attribute(value: Option<&str>) -> Self {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::NONE;
        };

        match raw.parse::<u32>() {
            Ok(priority) => Priority(priority),
            Err(_) => {
                tracing::warn!(value = raw, "Ignoring invalid preload priority");
                Self::NONE
            }
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if *self == Self::NONE {
            serializer.serialize_none()
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPriority {
            Number(i64),
            Text(String),
        }

        Ok(match Option::<RawPriority>::deserialize(deserializer)? {
            Some(RawPriority::Number(number)) => u32::try_from(number)
                .map(Priority)
                .unwrap_or(Priority::NONE),
            Some(RawPriority::Text(text)) => Priority::from_attribute(Some(&text)),
            None => Priority::NONE,
        })
    }
}

/// The kind of media a resource is loaded as.
///
/// Parsing is total: names that do not map to a known kind end up as
/// [`Unknown`](Self::Unknown), which no loader handles.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// Images, including CSS background images.
    #[default]
    Image,
    /// Audio that has to be ready for playback.
    Audio,
    /// Video that has to be ready for playback.
    Video,
    /// A kind without a known loader.
    Unknown(String),
}

impl ResourceKind {
    /// Returns the canonical name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Unknown(name) => name,
        }
    }
}

impl FromStr for ResourceKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "image" | "img" | "background" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            _ => Self::Unknown(s.trim().to_owned()),
        })
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(kind) => kind,
            Err(infallible) => match infallible {},
        }
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to preload one resource.
///
/// This is what a markup scanner produces for every declared `data-src` or `data-background`
/// attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadRequest {
    /// The resource identifier, usually a URL.
    pub key: String,
    /// The declared dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Selects the loader.
    #[serde(default)]
    pub kind: ResourceKind,
}

impl PreloadRequest {
    pub fn new(key: impl Into<String>, priority: impl Into<Priority>, kind: ResourceKind) -> Self {
        Self {
            key: key.into(),
            priority: priority.into(),
            kind,
        }
    }

    /// Builds a request from raw attribute values, normalizing the priority and kind.
    pub fn from_attributes(key: impl Into<String>, priority: Option<&str>, kind: &str) -> Self {
        Self {
            key: key.into(),
            priority: Priority::from_attribute(priority),
            kind: kind.into(),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        value.to_owned().into()
    }
}

/// A loaded resource.
#[derive(Clone, PartialEq, Eq)]
pub struct Resource {
    /// The kind this resource was loaded as.
    pub kind: ResourceKind,
    /// The raw resource contents.
    pub data: Bytes,
    /// The media type, if the loader could determine one.
    pub content_type: Option<String>,
}

impl Resource {
    pub fn new(kind: ResourceKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The size of the resource contents in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// A shared handle to a loaded resource.
///
/// The cache owns its entries; everyone else only holds handles to the same allocation.
pub type Payload = Arc<Resource>;
