use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crash::CrashHelper;

/// Function a plugin host instance can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    VideoDecoder,
    VideoEncoder,
    Decryptor,
}

impl CapabilityKind {
    /// API name advertised by plugins implementing this capability.
    pub fn api_name(self) -> &'static str {
        match self {
            CapabilityKind::VideoDecoder => "decode-video",
            CapabilityKind::VideoEncoder => "encode-video",
            CapabilityKind::Decryptor => "eme-decrypt",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CapabilityKind::VideoDecoder => "video decoder",
            CapabilityKind::VideoEncoder => "video encoder",
            CapabilityKind::Decryptor => "decryptor",
        };
        f.write_str(label)
    }
}

/// Identifier of a running plugin instance, unique within the process while
/// the instance is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub u32);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PluginId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Opaque origin/session identity a request is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Tags a plugin must advertise to serve a request (codec names, key systems).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityTags(Vec<String>);

impl CapabilityTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|candidate| candidate == tag)
    }

    /// Returns `true` when every tag in `self` is also present in `offered`.
    pub fn is_satisfied_by<'a, I>(&self, offered: I) -> bool
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.iter()
            .all(|tag| offered.clone().into_iter().any(|candidate| candidate == tag))
    }
}

impl fmt::Display for CapabilityTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilityTags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Capability instance living inside a plugin host.
pub trait CapabilityInstance: Send + Sync {
    /// Plugin instance that hosts this capability.
    fn plugin_id(&self) -> PluginId;

    /// Associates a crash helper so a later crash of the hosting plugin can be
    /// attributed to the helper's owner.
    fn set_crash_helper(&self, helper: Arc<dyn CrashHelper>);
}

pub trait VideoDecoder: CapabilityInstance {
    /// Decryptor feeding this decoder, `0` when the stream is not encrypted.
    fn decryptor_id(&self) -> u32;
}

pub trait VideoEncoder: CapabilityInstance {}

pub trait Decryptor: CapabilityInstance {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_subsets_of_offered_tags() {
        let requested = CapabilityTags::new(["h264"]);
        assert!(requested.is_satisfied_by(["vp8", "h264"]));
        assert!(!requested.is_satisfied_by(["vp8"]));
        assert!(CapabilityTags::default().is_satisfied_by(["vp8"]));
    }

    #[test]
    fn capability_kind_serializes_as_kebab_case() {
        let json = serde_json::to_string(&CapabilityKind::VideoDecoder).unwrap();
        assert_eq!(json, "\"video-decoder\"");
        assert_eq!(CapabilityKind::Decryptor.to_string(), "decryptor");
    }
}
