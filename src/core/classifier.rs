//! Maps compressor output lines to log categories.
//!
//! The compressor prints German status lines by default and English ones
//! when run under an English locale, so every category matches both token
//! sets. Categories are checked in priority order and the first hit wins:
//! a line like "Komprimiere bild.jpg ... Fehler" is still a progress tick.

use super::models::LogTag;

const PROGRESS_MARKERS: &[&str] = &["komprimiere", "compressing"];
const SUCCESS_MARKERS: &[&str] = &["✓", "✔", "fertig", "done"];
const ERROR_MARKERS: &[&str] = &["✗", "✘", "fehler", "error"];
const WARNING_MARKERS: &[&str] = &["⚠", "warnung", "warning"];

/// Classify one output line (without its trailing newline).
pub fn classify(line: &str) -> LogTag {
    let lowered = line.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if has(PROGRESS_MARKERS) {
        LogTag::Progress
    } else if has(SUCCESS_MARKERS) {
        LogTag::Success
    } else if has(ERROR_MARKERS) {
        LogTag::Error
    } else if has(WARNING_MARKERS) {
        LogTag::Warning
    } else {
        LogTag::Plain
    }
}
