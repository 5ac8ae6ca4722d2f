// pyznap is a policy-driven ZFS snapshot and replication tool
// Copyright (C) 2025  The pyznap authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io::IsTerminal;

// --- Constants ---

#[allow(non_upper_case_globals)]
pub mod size {
    pub const KiB: u64 = 1024;
    pub const MiB: u64 = KiB * 1024;
    pub const GiB: u64 = MiB * 1024;
    pub const TiB: u64 = GiB * 1024;
}

// --- Formatting ---

/// Formats a byte count into a human-readable string with binary prefixes.
#[allow(non_upper_case_globals)]
pub fn format_size(bytes: u64, precision: usize) -> String {
    if bytes >= size::TiB {
        format!("{:.precision$} TiB", (bytes as f64) / (size::TiB as f64))
    } else if bytes >= size::GiB {
        format!("{:.precision$} GiB", (bytes as f64) / (size::GiB as f64))
    } else if bytes >= size::MiB {
        format!("{:.precision$} MiB", (bytes as f64) / (size::MiB as f64))
    } else if bytes >= size::KiB {
        format!("{:.precision$} KiB", (bytes as f64) / (size::KiB as f64))
    } else {
        format!("{bytes} B")
    }
}

/// Formats a count with appropriate singular or plural suffix.
pub fn format_count<T>(count: T, singular: &str, plural: &str) -> String
where
    T: std::fmt::Display + PartialEq + From<u8>,
{
    if count == T::from(1) {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

// --- Shell quoting ---

/// Quotes a string so that a POSIX shell treats it as a single word.
///
/// ZFS dataset names may contain spaces, and snapshot names pass through a
/// remote user's login shell when sent over ssh.
pub fn sh_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c))
    {
        return word.to_string();
    }

    // Single quotes inhibit all shell expansion; an embedded single quote
    // closes the string, escapes the quote and reopens it.
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Quotes every word of a command and joins them into one shell word stream.
pub fn sh_join(argv: &[String]) -> String {
    argv.iter()
        .map(|w| sh_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether stdout is attached to a terminal. Drives pv display mode.
pub fn stdout_is_tty() -> bool {
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512, 1), "512 B");
        assert_eq!(format_size(2048, 1), "2.0 KiB");
        assert_eq!(format_size(3 * size::MiB, 1), "3.0 MiB");
        assert_eq!(format_size(5 * size::GiB, 1), "5.0 GiB");
    }

    #[test]
    fn test_sh_quote_plain() {
        assert_eq!(sh_quote("rpool/data"), "rpool/data");
        assert_eq!(sh_quote("tank@pyznap_2024-03-14_12:00:00_daily"), "tank@pyznap_2024-03-14_12:00:00_daily");
    }

    #[test]
    fn test_sh_quote_spaces() {
        assert_eq!(sh_quote("tank/my data"), "'tank/my data'");
    }

    #[test]
    fn test_sh_quote_single_quote() {
        assert_eq!(sh_quote("tank/it's"), r"'tank/it'\''s'");
    }

    #[test]
    fn test_sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_sh_join() {
        let argv = vec![
            "zfs".to_string(),
            "destroy".to_string(),
            "tank/my data@snap".to_string(),
        ];
        assert_eq!(sh_join(&argv), "zfs destroy 'tank/my data@snap'");
    }
}
