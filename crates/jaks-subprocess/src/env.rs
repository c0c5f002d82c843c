//! Environment-delta merging
//!
//! Deltas are overrides applied on top of an inherited environment. Names
//! are matched ignoring ASCII case so that a delta for `PATH` replaces an
//! inherited `Path` instead of adding a second variable next to it.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

/// Merge `delta` into `base`.
///
/// For each delta entry every base variable whose name matches ignoring
/// ASCII case is removed, and the delta value is stored under the first
/// matching base name (or the delta's own spelling when nothing matched).
/// Base order is preserved; new names are appended in delta order.
#[must_use]
pub fn merge_environment<I>(base: I, delta: &BTreeMap<String, String>) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut merged: Vec<(OsString, OsString)> = base.into_iter().collect();

    for (name, value) in delta {
        let wanted = OsStr::new(name);
        let position = merged
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(wanted));

        match position {
            Some(index) => {
                merged[index].1 = OsString::from(value);
                // `index` is the first match, so the first match seen here is the kept one
                let mut seen = 0usize;
                merged.retain(|(existing, _)| {
                    if !existing.eq_ignore_ascii_case(wanted) {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => merged.push((OsString::from(name), OsString::from(value))),
        }
    }

    merged
}

/// Snapshot of this process's environment.
#[must_use]
pub fn inherited_environment() -> Vec<(OsString, OsString)> {
    std::env::vars_os().collect()
}
