//! Parsing of the summary `rsync --stats` prints.

use serde::Serialize;

const FILES_PREFIX: &str = "Number of files:";
const TOTAL_SIZE_PREFIX: &str = "Total file size:";
const TRANSFERRED_PREFIX: &str = "Total transferred file size:";

/// Totals reported by `rsync --stats`. Fields are `None` when the line was
/// absent or unreadable.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TransferStats {
    /// Regular files in the transfer set.
    pub regular_files: Option<u64>,
    /// Combined size of every file in the transfer set.
    pub total_bytes: Option<u64>,
    /// Bytes of file data actually sent.
    pub transferred_bytes: Option<u64>,
}

impl TransferStats {
    /// Extracts totals from rsync's stdout.
    #[must_use]
    pub fn parse(stdout: &str) -> Self {
        let mut stats = Self::default();
        for line in stdout.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix(FILES_PREFIX) {
                stats.regular_files = parse_file_count(rest);
            } else if let Some(rest) = line.strip_prefix(TOTAL_SIZE_PREFIX) {
                stats.total_bytes = parse_byte_count(rest);
            } else if let Some(rest) = line.strip_prefix(TRANSFERRED_PREFIX) {
                stats.transferred_bytes = parse_byte_count(rest);
            }
        }
        stats
    }

    /// Returns `true` when both the file count and total size were found.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.regular_files.is_some() && self.total_bytes.is_some()
    }
}

/// Reads `1,234` style numbers. Thousands separators are stripped.
fn parse_number(text: &str) -> Option<u64> {
    let digits: String = text.trim().chars().filter(|ch| *ch != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Handles both `N (reg: R, dir: D, ...)` from rsync 3.1+ and a bare `N`
/// from older releases. A breakdown without `reg:` means no regular files.
fn parse_file_count(rest: &str) -> Option<u64> {
    let Some((_, parenthetical)) = rest.split_once('(') else {
        return parse_number(rest);
    };
    let regular = parenthetical
        .trim_end()
        .trim_end_matches(')')
        .split(", ")
        .filter_map(|entry| entry.split_once(':'))
        .find(|(key, _)| key.trim() == "reg")
        .map(|(_, value)| value);
    regular.map_or(Some(0), parse_number)
}

fn parse_byte_count(rest: &str) -> Option<u64> {
    let number = rest.trim().strip_suffix("bytes").unwrap_or(rest);
    parse_number(number)
}
