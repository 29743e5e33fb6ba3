//! Loads the redirector's settings.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use eyre::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// The name of the environment variable that can be used to point at a settings file.
pub const PATH_VAR: &str = "DWPACK_REDIRECT_SETTINGS";

/// The name of the settings file that is looked for next to the host executable.
const FILE_NAME: &str = "dwpack_redirect.json";

/// The redirector's settings.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    /// The directory containing one replacement directory per archive. Relative paths are
    /// resolved against the host's working directory.
    pub replacement_root: PathBuf,

    /// Archives are only redirected if their path matches this regular expression.
    pub archive_pattern: String,

    /// The size reported for every redirected archive. Replacements that don't fit in their
    /// original space are given offsets below this.
    pub virtual_ceiling: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            replacement_root: PathBuf::from("mods"),

            // A five-digit number before the extension, like `data00004.pac`.
            archive_pattern: String::from(r"(?i).+\d{5}\.pac$"),

            virtual_ceiling: 0xffff_ffff,
        }
    }
}

impl Options {
    /// Attempts to parse the contents of `reader` to get an `Options` value.
    pub fn parse_json(reader: impl Read) -> Result<Options> {
        Ok(serde_json::from_reader(reader)?)
    }

    fn global_mut() -> MutexGuard<'static, Option<Options>> {
        static OPTIONS: Lazy<Mutex<Option<Options>>> = Lazy::new(|| Mutex::new(None));
        OPTIONS.lock()
    }

    /// Returns the current settings, loading them if that hasn't happened yet.
    pub fn get() -> Options {
        Options::global_mut()
            .get_or_insert_with(Options::load)
            .clone()
    }

    /// Returns the path of the settings file.
    pub fn path() -> PathBuf {
        if let Some(path) = std::env::var_os(PATH_VAR) {
            return PathBuf::from(path);
        }

        base_dir().join(FILE_NAME)
    }

    /// Loads the settings file at `path`, returning `None` if there isn't one.
    pub fn load_from_file(path: &Path) -> Result<Option<Options>> {
        if !path.exists() {
            // This isn't an error, but we didn't find any settings.
            return Ok(None);
        }

        let file =
            File::open(path).wrap_err_with(|| format!("Unable to open settings file {:?}", path))?;

        Options::parse_json(file)
            .wrap_err_with(|| format!("Unable to parse settings file {:?}", path))
            .map(Some)
    }

    /// Either loads the settings from disk or generates default values for them.
    pub fn load() -> Options {
        let path = Options::path();

        match Options::load_from_file(&path) {
            Ok(Some(options)) => return options,
            Ok(None) => log::info!("No settings file at {:?}. Defaults will be used.", path),
            Err(err) => log::error!("Error loading settings: {:?}. Defaults will be used.", err),
        }

        Options::default()
    }
}

/// Returns the directory containing the host executable, or the working directory if that
/// can't be found.
pub fn base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads the settings and stores them globally.
pub fn init() {
    let options = Options::load();
    log::info!("Options: {:#?}", options);

    *Options::global_mut() = Some(options);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let options = Options::parse_json(&br#"{ "replacement_root": "D:\\mods" }"#[..]).unwrap();

        assert_eq!(options.replacement_root, PathBuf::from("D:\\mods"));
        assert_eq!(options.archive_pattern, Options::default().archive_pattern);
        assert_eq!(options.virtual_ceiling, 0xffff_ffff);
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(Options::parse_json(&b"{ replacement_root"[..]).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);

        assert_eq!(Options::load_from_file(&path).unwrap(), None);

        let options = Options {
            virtual_ceiling: 0x7fff_ffff,
            ..Options::default()
        };

        std::fs::write(&path, serde_json::to_string_pretty(&options).unwrap()).unwrap();
        assert_eq!(Options::load_from_file(&path).unwrap(), Some(options));
    }
}
