use std::path::PathBuf;

use anyhow::Result;
use photocache_core::Library;
use tokio::sync::broadcast::error::RecvError;

/// Watch every registered folder and the removable-media roots, printing
/// each event as a JSON line until Ctrl-C.
pub async fn run(lib: &Library) -> Result<()> {
    let folders: Vec<PathBuf> = lib
        .get_library_folders()?
        .into_iter()
        .map(|f| f.path)
        .collect();
    let mut events = lib.subscribe();

    if let Err(e) = lib.start_watching_folders(&folders) {
        tracing::warn!(error = %e, "some folders are not watched");
    }
    lib.start_drive_monitor()?;

    let watched = lib.get_watched_folders();
    println!("Watching {} folders. Press Ctrl-C to stop.", watched.len());
    for folder in &watched {
        println!("  {}", folder.display());
    }
    for drive in lib.detect_removable_drives() {
        println!("  removable media present: {}", drive.display());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            received = events.recv() => match received {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    for folder in watched {
        lib.stop_watching_folder(&folder);
    }
    Ok(())
}
