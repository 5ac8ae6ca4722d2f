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

use colored::Colorize;

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        if $crate::global::verbosity() >= 1 {
            println!($($arg)*)
        }
    };
}
pub use log;

/// Emitted only in verbose mode (`-v`); used for composed command lines and
/// per-dataset decisions.
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        if $crate::global::verbosity() >= 2 {
            println!($($arg)*)
        }
    };
}
pub use verbose;

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::ui::cli::log_error(&format!($($arg)*))
    };
}
pub use error;

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::ui::cli::log_warning(&format!($($arg)*))
    };
}
pub use crate::warn;

/// Prints a warning log (Warning: ...)
pub fn log_warning(str: &str) {
    eprintln!("{}: {}", "Warning".bold().yellow(), str);
}

/// Prints an error log (Error: ...)
pub fn log_error(str: &str) {
    eprintln!("{}: {}", "Error".bold().red(), str);
}
