use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::{
    config_path_from_env, load_or_create_config, resolve_path, FileMetadataManager,
    LibraryContext, LocalFolder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }
    let data_folder = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| resolve_path(&config_path, &config.data_folder));

    let manager = FileMetadataManager::new(LibraryContext::new(), Arc::new(LocalFolder), config);
    manager.set_data_folder(&data_folder);
    manager.init()?;

    let summary = manager.scan_folder(&PathBuf::from(&music_root), &CancellationToken::new())?;

    println!(
        "Scanned {} files ({} failed, {} playlist entries unresolved)",
        summary.files_scanned, summary.files_failed, summary.playlist_entries_skipped
    );
    println!(
        "Indexed: {} artists, {} albums, {} tracks, {} images, {} playlists",
        manager.artists().count(),
        manager.albums().count(),
        manager.tracks().count(),
        manager.images().count(),
        manager.playlists().count()
    );

    Ok(())
}
