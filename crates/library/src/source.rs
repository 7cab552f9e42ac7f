use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use metadata::MediaStream;
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle {
    pub path: PathBuf,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
    }
}

/// Access to a tree of files. Streams returned by `open_read` are released
/// when dropped.
pub trait FolderSource: Send + Sync {
    fn list_files(&self, folder: &Path, recursive: bool) -> io::Result<Vec<FileHandle>>;

    fn open_read(&self, file: &FileHandle) -> io::Result<Box<dyn MediaStream>>;

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// `FolderSource` over the local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFolder;

impl FolderSource for LocalFolder {
    fn list_files(&self, folder: &Path, recursive: bool) -> io::Result<Vec<FileHandle>> {
        if !folder.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a folder", folder.display()),
            ));
        }
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut files: Vec<FileHandle> = WalkDir::new(folder)
            .follow_links(false)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| FileHandle::new(entry.into_path()))
            .collect();
        files.sort();
        Ok(files)
    }

    fn open_read(&self, file: &FileHandle) -> io::Result<Box<dyn MediaStream>> {
        let handle = File::open(&file.path)?;
        Ok(Box::new(BufReader::new(handle)))
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, bytes)
    }
}
