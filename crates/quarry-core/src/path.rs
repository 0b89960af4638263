use std::fmt;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A normalized, component-wise virtual path.
///
/// All path comparisons in the cache layer are component-wise, never
/// substring-based, so that `foo2/bar` is not mistaken for a child of `foo/`.
/// Separators (`/` and `\`), empty components and `.` are stripped during
/// construction; everything else is kept literally (archive members may
/// legitimately contain `..` as a name).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OsPath {
    components: Vec<String>,
}

impl OsPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(components: Vec<String>) -> Self {
        Self { components }
    }

    /// Parses a path string, accepting both `/` and `\` as separators.
    pub fn parse(raw: &str) -> Self {
        let components = raw
            .split(['/', '\\'])
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect();
        Self { components }
    }

    pub fn from_std_path(path: &Path) -> Self {
        Self::parse(&path.to_string_lossy())
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    pub fn basename(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<OsPath> {
        if self.components.is_empty() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, component: impl Into<String>) -> OsPath {
        let mut components = self.components.clone();
        components.push(component.into());
        Self { components }
    }

    /// Reconstructs an absolute OS path for the local filesystem accessor.
    ///
    /// On Unix the components are rooted at `/`; on Windows the first
    /// component is expected to be the drive (e.g. `C:`).
    pub fn to_local_path(&self) -> std::path::PathBuf {
        let mut path = if cfg!(windows) {
            std::path::PathBuf::new()
        } else {
            std::path::PathBuf::from("/")
        };
        for component in &self.components {
            path.push(component);
        }
        path
    }

    /// Component-wise prefix test. The root is a prefix of every path.
    pub fn starts_with(&self, prefix: &OsPath) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }
}

impl fmt::Display for OsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

impl From<&str> for OsPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// A full description of how to reach a file: the accessor that serves it,
/// the path within that accessor, and (for container accessors such as `zip`)
/// the delegate spec describing the container itself.
///
/// Nested containers compose naturally: the delegate of an inner archive is a
/// `zip` spec whose own delegate names the outer archive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSpec {
    pub accessor: String,
    pub path: OsPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Box<FileSpec>>,
}

impl FileSpec {
    pub fn new(accessor: impl Into<String>, path: impl Into<OsPath>) -> Self {
        Self {
            accessor: accessor.into(),
            path: path.into(),
            delegate: None,
        }
    }

    /// A spec served by the local filesystem accessor.
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::new("file", OsPath::from_std_path(path.as_ref()))
    }

    pub fn with_delegate(mut self, delegate: FileSpec) -> Self {
        self.delegate = Some(Box::new(delegate));
        self
    }

    pub fn delegate(&self) -> Option<&FileSpec> {
        self.delegate.as_deref()
    }

    /// Replaces the member path, keeping accessor and delegate.
    pub fn with_path(&self, path: OsPath) -> Self {
        Self {
            accessor: self.accessor.clone(),
            path,
            delegate: self.delegate.clone(),
        }
    }

    /// Derives the deterministic cache key for this spec.
    ///
    /// Two requests that open the same underlying bytes through the same
    /// accessor chain must produce equal keys; specs differing anywhere in
    /// the chain must not collide. Every variable-length piece is length
    /// prefixed so concatenation ambiguities cannot produce collisions.
    pub fn cache_key(&self, discriminator: &str) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}:{}|", discriminator.len(), discriminator);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut String) {
        let _ = write!(out, "{}:{}|", self.accessor.len(), self.accessor);
        let _ = write!(out, "{}|", self.path.components().len());
        for component in self.path.components() {
            let _ = write!(out, "{}:{}|", component.len(), component);
        }
        match &self.delegate {
            Some(delegate) => {
                out.push_str("d|");
                delegate.encode_into(out);
            }
            None => out.push_str("-|"),
        }
    }
}

impl fmt::Display for FileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.delegate {
            Some(delegate) => write!(f, "{}://{{{}}}/{}", self.accessor, delegate, self.path),
            None => write!(f, "{}://{}", self.accessor, self.path),
        }
    }
}
