//! Settings resolution: command-line flags over a TOML config file over
//! built-in defaults.
//!
//! Config file search order:
//! 1. `--config PATH` (must exist)
//! 2. `permcheck.toml` in the current directory
//! 3. `config.toml` in the user config dir (e.g. `~/.config/permcheck/`)
//!
//! Relative paths inside a config file are resolved against the file's
//! directory.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use permbridge_host::Encoding;
use serde::Deserialize;
use tracing::debug;

/// Config file name looked up in the current directory.
pub(crate) const LOCAL_CONFIG: &str = "permcheck.toml";

/// Optional settings, as read from a config file or collected from flags.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) module: Option<PathBuf>,
    pub(crate) database: Option<PathBuf>,
    pub(crate) encoding: Option<Encoding>,
}

/// Fully resolved settings for one run.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) module: PathBuf,
    pub(crate) database: PathBuf,
    pub(crate) encoding: Encoding,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            module: PathBuf::from("module.wasm"),
            database: PathBuf::from("db.json"),
            encoding: Encoding::default(),
        }
    }
}

impl Settings {
    /// Find and load the config file, then apply `flags` on top.
    pub(crate) fn resolve(explicit: Option<&Path>, flags: FileConfig) -> Result<Self> {
        let file = match find_config(explicit) {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                load_config(&path)?
            }
            None => FileConfig::default(),
        };
        Ok(Self::merge(file, flags))
    }

    /// Flags win over file values, file values over defaults.
    pub(crate) fn merge(file: FileConfig, flags: FileConfig) -> Self {
        let defaults = Self::default();
        Self {
            module: flags.module.or(file.module).unwrap_or(defaults.module),
            database: flags.database.or(file.database).unwrap_or(defaults.database),
            encoding: flags.encoding.or(file.encoding).unwrap_or(defaults.encoding),
        }
    }
}

fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }

    directories::ProjectDirs::from("dev", "permbridge", "permcheck")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .filter(|path| path.is_file())
}

pub(crate) fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
    let mut config: FileConfig = toml::from_str(&content)
        .wrap_err_with(|| format!("invalid config file {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    config.module = config.module.map(|p| base.join(p));
    config.database = config.database.map(|p| base.join(p));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::merge(FileConfig::default(), FileConfig::default());
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.module, PathBuf::from("module.wasm"));
        assert_eq!(settings.database, PathBuf::from("db.json"));
        assert_eq!(settings.encoding, Encoding::Latin1);
    }

    #[test]
    fn flags_override_file_values() {
        let file = FileConfig {
            module: Some(PathBuf::from("/etc/policy.wasm")),
            database: Some(PathBuf::from("/etc/db.json")),
            encoding: Some(Encoding::Utf8),
        };
        let flags = FileConfig {
            module: Some(PathBuf::from("local.wasm")),
            database: None,
            encoding: Some(Encoding::Latin1),
        };

        let settings = Settings::merge(file, flags);
        assert_eq!(settings.module, PathBuf::from("local.wasm"));
        assert_eq!(settings.database, PathBuf::from("/etc/db.json"));
        assert_eq!(settings.encoding, Encoding::Latin1);
    }

    #[test]
    fn config_paths_are_relative_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permcheck.toml");
        std::fs::write(
            &path,
            "module = \"guest.wasm\"\ndatabase = \"/abs/db.json\"\nencoding = \"utf8\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.module, Some(dir.path().join("guest.wasm")));
        assert_eq!(config.database, Some(PathBuf::from("/abs/db.json")));
        assert_eq!(config.encoding, Some(Encoding::Utf8));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permcheck.toml");
        std::fs::write(&path, "modul = \"typo.wasm\"\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown field"), "{err:#}");
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = Settings::resolve(Some(missing.as_path()), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
