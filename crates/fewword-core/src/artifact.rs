//! Artifact identity, on-disk layout and file I/O.
//!
//! Scratch artifacts are named
//! `{token}_{YYYYMMDD_HHMMSS}_{id}_exit{code}.txt`; legacy artifacts have no
//! exit suffix. Compressed artifacts carry an extra `.zst`. Writes go through
//! a hidden temp file in the destination directory followed by a rename, so a
//! reader never observes a partial artifact under its final name.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::error::{FewwordError, Result};

pub const SCRATCH_DIR: &str = ".fewword/scratch/tool_outputs";
pub const INDEX_DIR: &str = ".fewword/index";
pub const MANIFEST_FILE: &str = "tool_outputs.jsonl";
pub const PINNED_DIR: &str = ".fewword/memory/pinned";
pub const EXPORTS_DIR: &str = ".fewword/exports";

pub const COMPRESSED_SUFFIX: &str = ".zst";
pub const TEMP_SUFFIX: &str = ".tmp";

const ID_LEN: usize = 8;

/// Eight lowercase hex characters, unique per creation event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Fresh random id.
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..ID_LEN].to_string())
    }

    /// Parse an id, accepting either case.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() == ID_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(FewwordError::InvalidArtifactId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = FewwordError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ArtifactId> for String {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed scratch artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub token: String,
    /// `YYYYMMDD_HHMMSS`, UTC.
    pub timestamp: String,
    pub id: ArtifactId,
    /// `None` for legacy names.
    pub exit_code: Option<i32>,
    pub compressed: bool,
}

impl ArtifactName {
    pub fn new(token: &str, at: DateTime<Utc>, id: ArtifactId, exit_code: Option<i32>) -> Self {
        Self {
            token: token.to_string(),
            timestamp: at.format("%Y%m%d_%H%M%S").to_string(),
            id,
            exit_code,
            compressed: false,
        }
    }

    /// Name without `.txt` or `.zst`.
    pub fn stem(&self) -> String {
        match self.exit_code {
            Some(code) => format!("{}_{}_{}_exit{}", self.token, self.timestamp, self.id, code),
            None => format!("{}_{}_{}", self.token, self.timestamp, self.id),
        }
    }

    pub fn file_name(&self) -> String {
        let mut name = format!("{}.txt", self.stem());
        if self.compressed {
            name.push_str(COMPRESSED_SUFFIX);
        }
        name
    }

    /// Parse a scratch file name. Anything that is not an artifact name,
    /// including temp files, yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (rest, compressed) = match file_name.strip_suffix(COMPRESSED_SUFFIX) {
            Some(r) => (r, true),
            None => (file_name, false),
        };
        let rest = rest.strip_suffix(".txt")?;
        let mut parts: Vec<&str> = rest.split('_').collect();

        let exit_code = match parts.last().and_then(|p| p.strip_prefix("exit")) {
            Some(code) => {
                let code = code.parse::<i32>().ok()?;
                parts.pop();
                Some(code)
            }
            None => None,
        };

        let id = ArtifactId::parse(parts.pop()?).ok()?;
        let time = parts.pop()?;
        let date = parts.pop()?;
        let all_digits = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(date, 8) || !all_digits(time, 6) {
            return None;
        }

        let token = parts.join("_");
        if token.is_empty()
            || !token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }

        Some(Self {
            token,
            timestamp: format!("{date}_{time}"),
            id,
            exit_code,
            compressed,
        })
    }
}

/// Paths under a workspace root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.index_dir().join(MANIFEST_FILE)
    }

    pub fn pinned_dir(&self) -> PathBuf {
        self.root.join(PINNED_DIR)
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join(EXPORTS_DIR)
    }

    /// Path relative to the root with `/` separators, as stored in the manifest.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Absolute path for a manifest-relative path.
    pub fn absolute(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

/// True for in-progress temp file names (`.{final}.{random}.tmp`).
pub fn is_temp_name(file_name: &str) -> bool {
    file_name.ends_with(TEMP_SUFFIX)
}

/// Write `data` to `dir/file_name` atomically.
pub fn write_atomic(dir: &Path, file_name: &str, data: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(file_name);
    let mut tmp = Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&final_path).map_err(|e| e.error)?;
    Ok(final_path)
}

/// Find an artifact on disk: the literal path, then its compressed twin.
pub fn resolve_path(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let mut compressed = path.as_os_str().to_owned();
    compressed.push(COMPRESSED_SUFFIX);
    let compressed = PathBuf::from(compressed);
    compressed.is_file().then_some(compressed)
}

fn is_compressed(path: &Path) -> bool {
    path.to_string_lossy().ends_with(COMPRESSED_SUFFIX)
}

/// Read artifact content, decompressing transparently. Invalid UTF-8 is
/// replaced rather than rejected.
pub fn read_artifact(path: &Path) -> Result<String> {
    let resolved =
        resolve_path(path).ok_or_else(|| FewwordError::ArtifactNotFound(path.display().to_string()))?;
    let bytes = if is_compressed(&resolved) {
        zstd::stream::decode_all(fs::File::open(&resolved)?)?
    } else {
        fs::read(&resolved)?
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Replace `path` with a zstd-compressed `path.zst`. Returns the new path.
///
/// The compressed file is fully written before the original is removed.
pub fn compress_file(path: &Path, level: i32) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| FewwordError::ArtifactNotFound(path.display().to_string()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FewwordError::ArtifactNotFound(path.display().to_string()))?;
    let raw = fs::read(path)?;
    let packed = zstd::stream::encode_all(raw.as_slice(), level)?;
    let out = write_atomic(dir, &format!("{name}{COMPRESSED_SUFFIX}"), &packed)?;
    fs::remove_file(path)?;
    Ok(out)
}
