mod cache;
mod config;
mod error;
mod manager;
mod playlist;
mod records;
mod repository;
mod scanner;
mod source;

pub use cache::{InstanceCache, LibraryContext, Model};
pub use config::{
    config_path_from_env, load_or_create_config, resolve_path, save_config, LibraryConfig,
};
pub use error::LibraryError;
pub use manager::{FileMetadataManager, ScanEvent, ScanSummary};
pub use playlist::{parse_smil, MediaEntry, ParsedPlaylist, PlaylistParser, SmilDocument, TrackResolver};
pub use repository::{MetadataRepository, Record, RepositoryEvent, UpsertSummary};
pub use scanner::{
    build_file_metadata, AudioMetadataScanner, FileMetadata, ScanFailure, ScanStream, ScanTypes,
};
pub use source::{FileHandle, FolderSource, LocalFolder};

pub use common::{
    AlbumMetadata, ArtistMetadata, ImageMetadata, ImageSource, PlaylistMetadata, TrackMetadata,
};
pub use metadata::{
    CoverArt, FailureKind, FileProperties, FilePropertyExtractor, MediaStream, MetadataError,
    TagExtractor, TagInfo,
};
