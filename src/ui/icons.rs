//! Shared UI icons and emojis.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[STOP]");

// Stage indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

// Artifacts and research
pub static FILE_NEW: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[RECON]");
pub static CACHE: Emoji<'_, '_> = Emoji("📦 ", "[CACHE]");
