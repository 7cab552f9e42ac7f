use std::fs;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::{FileProperties, FilePropertyExtractor, MediaStream, MetadataError};

/// File properties from the stream length and the file system entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsPropertyExtractor;

impl FilePropertyExtractor for FsPropertyExtractor {
    fn properties(
        &self,
        stream: &mut dyn MediaStream,
        path: &Path,
    ) -> Result<FileProperties, MetadataError> {
        let size = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;

        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs());

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(FileProperties {
            title,
            size,
            modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn reports_size_and_rewinds() {
        let mut stream = Cursor::new(vec![1u8; 10]);
        let props = FsPropertyExtractor
            .properties(&mut stream, Path::new("/nowhere/01 - Intro.flac"))
            .unwrap();
        assert_eq!(props.size, 10);
        assert_eq!(props.title.as_deref(), Some("01 - Intro"));
        assert_eq!(props.modified, None);
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 10);
    }
}
