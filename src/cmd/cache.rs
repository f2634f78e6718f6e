//! Knowledge cache inspection (`slotflow cache`).

use anyhow::{Result, bail};
use chrono::Utc;
use console::style;
use slotflow::cache::{KnowledgeCache, StoredEntry};
use slotflow::config::SlotflowConfig;

use super::super::CacheCommands;

fn freshness_label(stored: &StoredEntry, cache: &KnowledgeCache) -> String {
    if stored.is_fresh(cache.freshness(), Utc::now()) {
        style("fresh").green().to_string()
    } else {
        style("stale").yellow().to_string()
    }
}

pub fn cmd_cache(config: &SlotflowConfig, command: CacheCommands) -> Result<()> {
    let cache = KnowledgeCache::new(&config.cache_dir(), config.freshness()?);

    match command {
        CacheCommands::List => {
            let entries = cache.list()?;
            if entries.is_empty() {
                println!("Knowledge cache is empty.");
                println!("Research a jurisdiction with 'slotflow recon <jurisdiction>'.");
                return Ok(());
            }

            println!();
            for stored in &entries {
                println!(
                    "  {:<20} {}  {}  {}",
                    style(&stored.entry.jurisdiction).cyan(),
                    stored.entry.fetched_at.format("%Y-%m-%d %H:%M"),
                    freshness_label(stored, &cache),
                    style(&stored.entry.digest[..stored.entry.digest.len().min(12)]).dim()
                );
            }
            println!();
            println!(
                "{} jurisdiction(s); entries older than {} days are refreshed",
                entries.len(),
                cache.freshness().num_days()
            );
        }
        CacheCommands::Show {
            jurisdiction,
            history,
        } => {
            let Some(stored) = cache.get(&jurisdiction)? else {
                bail!("No cached research for '{}'", jurisdiction);
            };

            println!();
            println!("{} ({})", style(&stored.entry.jurisdiction).bold(), freshness_label(&stored, &cache));
            println!("  key:        {}", stored.entry.key);
            println!("  fetched:    {}", stored.entry.fetched_at.to_rfc3339());
            println!("  digest:     {}", stored.entry.digest);
            if let Some(run) = &stored.entry.source_run {
                println!("  source run: {}", run);
            }
            println!("  file:       {}", stored.path.display());
            println!();
            println!("{}", serde_json::to_string_pretty(&stored.entry.payload)?);

            if history {
                println!();
                println!("History:");
                for older in cache.history(&jurisdiction)?.iter().rev() {
                    println!(
                        "  {}  {}",
                        older.entry.fetched_at.format("%Y-%m-%d %H:%M:%S"),
                        style(older.path.display()).dim()
                    );
                }
            }
            println!();
        }
    }

    Ok(())
}
