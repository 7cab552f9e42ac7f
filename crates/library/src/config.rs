use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::scanner::ScanTypes;
use crate::LibraryError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub data_folder: String,
    pub degrees_of_parallelism: usize,
    pub scan_types: ScanTypes,
    pub batch_size: usize,
    pub audio_extensions: Vec<String>,
    pub playlist_extensions: Vec<String>,
    pub cover_file_names: Vec<String>,
    pub persist_cover_art: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            data_folder: "library-data".to_string(),
            degrees_of_parallelism: default_parallelism(),
            scan_types: ScanTypes::default(),
            batch_size: 64,
            audio_extensions: ["mp3", "flac", "ogg", "opus", "m4a", "wav", "wma", "aiff"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            playlist_extensions: ["smil", "wpl", "zpl"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            cover_file_names: [
                "cover.jpg",
                "cover.jpeg",
                "cover.png",
                "folder.jpg",
                "folder.jpeg",
                "folder.png",
                "front.jpg",
                "front.png",
                "album.jpg",
                "album.png",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            persist_cover_art: false,
        }
    }
}

impl LibraryConfig {
    pub fn is_audio(&self, ext: &str) -> bool {
        self.audio_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }

    pub fn is_playlist(&self, ext: &str) -> bool {
        self.playlist_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }

    pub fn is_cover(&self, file_name: &str) -> bool {
        self.cover_file_names
            .iter()
            .any(|known| known.eq_ignore_ascii_case(file_name))
    }

    /// Fills in values that would make scanning impossible.
    fn normalize(&mut self) {
        if self.degrees_of_parallelism == 0 {
            self.degrees_of_parallelism = default_parallelism();
        }
        if self.batch_size == 0 {
            self.batch_size = 64;
        }
        if self.data_folder.trim().is_empty() {
            self.data_folder = "library-data".to_string();
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LIBRARY_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(LibraryConfig, bool), LibraryError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: LibraryConfig = serde_yaml::from_str(&contents)?;
        config.normalize();
        return Ok((config, false));
    }

    let config = LibraryConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &LibraryConfig) -> Result<(), LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
