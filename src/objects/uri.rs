use crate::{ForgeError, Result};

/// Parsed `<scheme>://<bucket>/<path>` artifact location.
///
/// The URI is opaque to everything except the object store adapter; the
/// database only ever stores the rendered string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub scheme: String,
    pub bucket: String,
    pub path: String,
}

impl ObjectUri {
    pub fn new(scheme: &str, bucket: &str, path: &str) -> Result<Self> {
        let uri = Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            path: path.trim_start_matches('/').to_string(),
        };
        uri.validate()?;
        Ok(uri)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ForgeError::InvalidObjectUri(format!("missing scheme: {raw}")))?;
        let (bucket, path) = rest
            .split_once('/')
            .ok_or_else(|| ForgeError::InvalidObjectUri(format!("missing object path: {raw}")))?;
        let uri = Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            path: path.to_string(),
        };
        uri.validate()?;
        Ok(uri)
    }

    fn validate(&self) -> Result<()> {
        if self.scheme.is_empty()
            || !self
                .scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
        {
            return Err(ForgeError::InvalidObjectUri(format!(
                "bad scheme in {self}"
            )));
        }
        if self.bucket.is_empty() {
            return Err(ForgeError::InvalidObjectUri(format!(
                "empty bucket in {self}"
            )));
        }
        if self.path.is_empty() {
            return Err(ForgeError::InvalidObjectUri(format!(
                "empty object path in {self}"
            )));
        }
        if self.path.contains('\\') {
            return Err(ForgeError::InvalidObjectUri(format!(
                "backslash in object path: {self}"
            )));
        }
        // Reject traversal and degenerate segments outright.
        for segment in self.path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(ForgeError::InvalidObjectUri(format!(
                    "traversal segment in object path: {self}"
                )));
            }
        }
        Ok(())
    }

    /// File-name portion of the object path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Extension of the object path, including multi-part archive suffixes
    /// (`tar.gz`), without the leading dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        if let Some(stripped) = name.strip_suffix(".tar.gz") {
            if !stripped.is_empty() {
                return Some("tar.gz");
            }
        }
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path)
    }
}
