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

pub mod defaults;

use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::commands::GlobalArgs;
use crate::global::defaults::DEFAULT_VERBOSITY;

pub struct GlobalOpts {
    pub verbosity: u32,
    pub dry_run: bool,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            verbosity: DEFAULT_VERBOSITY,
            dry_run: false,
        }
    }
}

pub static GLOBAL_OPTS: LazyLock<RwLock<GlobalOpts>> =
    LazyLock::new(|| RwLock::new(GlobalOpts::default()));

/// Set by the SIGINT handler; polled by the dispatch loops and the pipeline
/// supervisor.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn set_global_opts_with_args(global_args: &GlobalArgs) {
    let verbosity = if global_args.quiet {
        0
    } else if global_args.verbose {
        2
    } else {
        DEFAULT_VERBOSITY
    };

    let new_opts = GlobalOpts {
        verbosity,
        dry_run: global_args.dry_run,
    };

    let mut opts_guard = GLOBAL_OPTS.write();
    *opts_guard = new_opts;
}

pub fn global_opts() -> RwLockReadGuard<'static, GlobalOpts> {
    GLOBAL_OPTS.read()
}

#[inline]
pub fn verbosity() -> u32 {
    GLOBAL_OPTS.read().verbosity
}

#[inline]
pub fn dry_run() -> bool {
    GLOBAL_OPTS.read().dry_run
}

#[inline]
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[inline]
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
