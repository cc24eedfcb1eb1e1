//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static SHIELD: Emoji<'_, '_> = Emoji("🛡️  ", "[WAF]");
pub static FINDING: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
