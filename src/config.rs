use crate::core::{Result, RxError};
use rusqlite::OpenFlags;
use serde::Deserialize;
use std::fs;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;
use std::time::Duration;

/// Flags controlling how a database file is opened.
///
/// Combine with `|`, e.g. `OpenMode::READ_WRITE | OpenMode::CREATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(u8);

impl OpenMode {
    /// The database is opened in read-only mode.
    pub const READ_ONLY: OpenMode = OpenMode(0b001);
    /// The database is opened for reading and writing if possible.
    pub const READ_WRITE: OpenMode = OpenMode(0b010);
    /// The database is created if it does not already exist.
    pub const CREATE: OpenMode = OpenMode(0b100);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn to_flags(self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.contains(OpenMode::READ_ONLY) {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        }
        if self.contains(OpenMode::READ_WRITE) {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
        }
        if self.contains(OpenMode::CREATE) {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::READ_WRITE | OpenMode::CREATE
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}

/// A single open flag as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeFlag {
    ReadOnly,
    ReadWrite,
    Create,
}

impl From<ModeFlag> for OpenMode {
    fn from(flag: ModeFlag) -> Self {
        match flag {
            ModeFlag::ReadOnly => OpenMode::READ_ONLY,
            ModeFlag::ReadWrite => OpenMode::READ_WRITE,
            ModeFlag::Create => OpenMode::CREATE,
        }
    }
}

/// Connection settings parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the database file, or ":memory:"
    pub path: String,
    /// Open flags; defaults to `["read_write", "create"]` when empty
    #[serde(default)]
    pub mode: Vec<ModeFlag>,
    /// Lock-wait timeout applied right after opening
    pub busy_timeout_ms: Option<i64>,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        DatabaseConfig {
            path: path.into(),
            mode: Vec::new(),
            busy_timeout_ms: None,
        }
    }

    pub fn open_mode(&self) -> OpenMode {
        let mut flags = self.mode.iter().copied().map(OpenMode::from);
        match flags.next() {
            Some(first) => flags.fold(first, BitOr::bitor),
            None => OpenMode::default(),
        }
    }

    /// The busy timeout, ignoring non-positive values.
    pub fn busy_timeout(&self) -> Option<Duration> {
        positive_millis(self.busy_timeout_ms?)
    }
}

pub(crate) fn positive_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().filter(|ms| *ms > 0).map(Duration::from_millis)
}

/// Loads connection settings from a TOML file at the given path.
///
/// # Example
///
/// ```ignore
/// let config = load_config("database.toml")?;
/// let db = Database::open_config(&config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DatabaseConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses connection settings from TOML text.
pub fn parse_config(content: &str) -> Result<DatabaseConfig> {
    toml::from_str(content).map_err(|e| RxError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
path = "/var/lib/app/data.db"
mode = ["read_write", "create"]
busy_timeout_ms = 250
"#;

    #[test]
    fn test_load_config_from_str() {
        let config = parse_config(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert_eq!(config.path, "/var/lib/app/data.db");
        assert_eq!(config.open_mode(), OpenMode::READ_WRITE | OpenMode::CREATE);
        assert_eq!(config.busy_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_config_defaults() {
        let config = parse_config(r#"path = ":memory:""#).unwrap();
        assert_eq!(config.open_mode(), OpenMode::default());
        assert_eq!(config.busy_timeout(), None);

        let config = parse_config("path = \"a.db\"\nmode = [\"read_only\"]\nbusy_timeout_ms = -5").unwrap();
        assert_eq!(config.open_mode(), OpenMode::READ_ONLY);
        assert_eq!(config.busy_timeout(), None);
    }

    #[test]
    fn test_invalid_config() {
        let err = parse_config(r#"mode = ["sideways"]"#).unwrap_err();
        assert!(matches!(err, RxError::Config(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.toml");
        fs::write(&path, SAMPLE_CONFIG).unwrap();
        assert_eq!(load_config(&path).unwrap().busy_timeout_ms, Some(250));

        let missing = load_config(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, RxError::Io(_)));
    }

    #[test]
    fn test_mode_flags() {
        let mode = OpenMode::READ_ONLY;
        assert!(mode.to_flags().contains(OpenFlags::SQLITE_OPEN_READ_ONLY));
        assert!(!mode.to_flags().contains(OpenFlags::SQLITE_OPEN_CREATE));

        let mut mode = OpenMode::READ_WRITE;
        mode |= OpenMode::CREATE;
        assert!(mode.contains(OpenMode::CREATE));
        assert!(mode
            .to_flags()
            .contains(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE));
        assert_eq!(positive_millis(0), None);
        assert_eq!(positive_millis(100), Some(Duration::from_millis(100)));
    }
}
