// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Returns a copy of `schedule` with the element at `index` removed.
pub(crate) fn remove_index(schedule: &[String], index: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(schedule.len().saturating_sub(1));
    out.extend_from_slice(&schedule[..index]);
    out.extend_from_slice(&schedule[index + 1..]);
    out
}

/// Returns the position of the first failed test in a result vector.
pub(crate) fn first_failed(results: &[bool]) -> Option<usize> {
    results.iter().position(|passed| !passed)
}
