//! Image references for sandboxes.

use serde::{Deserialize, Serialize};

/// Image a sandbox is started from.
///
/// The reference is kept verbatim; it is also the value used when asking
/// the platform for containers descended from this image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Full image reference (registry/repository:tag@digest).
    reference: String,

    /// When to pull the image before starting.
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl ImageRef {
    /// Creates an image reference with the default pull policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use testbed_orchestrator::sandbox::ImageRef;
    ///
    /// let image = ImageRef::new("postgres:18-alpine");
    /// assert_eq!(image.repository(), "postgres");
    /// assert_eq!(image.tag(), Some("18-alpine"));
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            pull_policy: PullPolicy::default(),
        }
    }

    /// Sets the pull policy.
    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Returns the full reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the repository part (no tag, no digest).
    ///
    /// A registry host with a port (`localhost:5000/app:1`) keeps its port.
    pub fn repository(&self) -> &str {
        let without_digest = self.without_digest();
        match without_digest.rfind(':') {
            Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
            _ => without_digest,
        }
    }

    /// Returns the tag, if one is present.
    pub fn tag(&self) -> Option<&str> {
        let without_digest = self.without_digest();
        let idx = without_digest.rfind(':')?;
        let tag = &without_digest[idx + 1..];
        (!tag.contains('/')).then_some(tag)
    }

    /// Returns the digest, if one is present.
    pub fn digest(&self) -> Option<&str> {
        self.reference.split_once('@').map(|(_, digest)| digest)
    }

    /// Returns the reference to pull, defaulting the tag to `latest`.
    pub fn pull_reference(&self) -> String {
        if self.tag().is_some() || self.digest().is_some() {
            self.reference.clone()
        } else {
            format!("{}:latest", self.reference)
        }
    }

    fn without_digest(&self) -> &str {
        self.reference
            .split_once('@')
            .map_or(self.reference.as_str(), |(name, _)| name)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

impl From<&str> for ImageRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageRef {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// When the runtime should pull an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Always pull the image.
    Always,

    /// Pull only if the image is not present locally.
    #[default]
    IfNotPresent,

    /// Never pull; locally built images (the service under test) use this.
    Never,
}
