//! [`PluginManifest`] – what the hub knows about a plugin directory.
//!
//! A plugin is a directory under the modules root:
//!
//! ```text
//! modules/
//!   weather/
//!     main.py           entry point
//!     requirements.txt  dependency manifest
//!     AUTHOR.txt        author name
//!     TITLE.txt         display title
//!     PHOTO.png         author photo
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use robohub_types::{HubError, Identifier};

pub const ENTRY_POINT: &str = "main.py";
pub const REQUIREMENTS: &str = "requirements.txt";
pub const AUTHOR_FILE: &str = "AUTHOR.txt";
pub const TITLE_FILE: &str = "TITLE.txt";
pub const PHOTO_FILE: &str = "PHOTO.png";

/// Placeholder for missing author/title metadata.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    /// Directory name; unique per hub session.
    pub module_id: String,
    pub dir: PathBuf,
    pub author: String,
    pub title: String,
}

impl PluginManifest {
    /// Read a plugin directory's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] when `dir` is not a directory.
    pub fn load(dir: &Path) -> Result<Self, HubError> {
        if !dir.is_dir() {
            return Err(HubError::Config(format!(
                "plugin directory {} does not exist",
                dir.display()
            )));
        }
        let module_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HubError::Config(format!("invalid plugin path {}", dir.display())))?;

        Ok(Self {
            module_id,
            dir: dir.to_path_buf(),
            author: read_meta(&dir.join(AUTHOR_FILE)),
            title: read_meta(&dir.join(TITLE_FILE)),
        })
    }

    /// Every plugin directory directly under `modules_dir`, sorted by id.
    /// A missing modules directory yields an empty list.
    pub fn discover(modules_dir: &Path) -> Result<Vec<Self>, HubError> {
        if !modules_dir.exists() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in fs::read_dir(modules_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                manifests.push(Self::load(&path)?);
            }
        }
        manifests.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(manifests)
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::new(&self.module_id, &self.author, &self.title)
    }

    pub fn entry_point(&self) -> PathBuf {
        self.dir.join(ENTRY_POINT)
    }

    pub fn requirements(&self) -> PathBuf {
        self.dir.join(REQUIREMENTS)
    }
}

fn read_meta(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}
