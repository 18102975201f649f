//! Shared UI icons, with plain-text fallbacks for terminals without emoji.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Run structure
pub static PHASE: Emoji<'_, '_> = Emoji("🌊 ", "[P]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static SCALE: Emoji<'_, '_> = Emoji("📊 ", "[C]");
