use std::path::PathBuf;

use anyhow::Result;
use photocache_core::domain::CacheStats;
use photocache_core::Library;

use super::{display_name, format_size};

/// Bytes saved by serving artifacts instead of originals.
pub(crate) fn savings(stats: &CacheStats) -> u64 {
    stats.original_size.saturating_sub(stats.cached_size)
}

/// Share of the size budget in use, as a percentage.
pub(crate) fn budget_used(stats: &CacheStats) -> f64 {
    if stats.max_size == 0 {
        return 0.0;
    }
    stats.cached_size as f64 * 100.0 / stats.max_size as f64
}

pub fn stats(lib: &Library) -> Result<()> {
    let stats = lib.get_database_cache_stats()?;

    println!();
    println!("  Cache");
    println!("  -----");
    println!(
        "   Entries:    {:>8}        Cached:      {}",
        stats.entry_count,
        format_size(stats.cached_size)
    );
    println!(
        "   Originals:  {:>8}        Saved:       {}",
        format_size(stats.original_size),
        format_size(savings(&stats))
    );
    println!(
        "   Budget:     {:>8}        Used:        {:.1}%",
        format_size(stats.max_size),
        budget_used(&stats)
    );
    println!("   Location:   {}", lib.config().cache_root.display());
    println!();
    Ok(())
}

pub async fn cleanup(lib: &Library) -> Result<()> {
    let removed = lib.cleanup_orphaned_cache().await?;
    println!("Removed {removed} orphaned cache entries");
    Ok(())
}

pub async fn clear(lib: &Library, folder: PathBuf) -> Result<()> {
    let before = lib.get_database_cache_stats()?;
    lib.clear_folder_cache(&folder).await?;
    let after = lib.get_database_cache_stats()?;
    println!(
        "Cleared {} artifacts ({}) for {}",
        before.entry_count.saturating_sub(after.entry_count),
        format_size(before.cached_size.saturating_sub(after.cached_size)),
        display_name(&folder)
    );
    Ok(())
}
