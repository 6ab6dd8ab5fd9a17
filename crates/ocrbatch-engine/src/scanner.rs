//! Wave scanner: derives the next runnable set of record keys.
//!
//! A pure function over filesystem inputs and state-store snapshots.
//! Pages within a book form a chain ordered by page number; a page is
//! runnable only when its immediately preceding *labelled* page is
//! Done. The first labelled page of a book is dependency-free, so a
//! book whose labels start at page 3 starts its chain at page 3.
//!
//! Identical inputs always produce an identical, stably ordered output.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use ocrbatch_types::{BookId, RecordKey};

/// Inputs to one scan pass. Snapshots are taken by the caller so the
/// scan itself never touches the state store.
#[derive(Debug)]
pub struct ScanParams<'a> {
    pub label_root: &'a Path,
    pub output_root: &'a Path,
    /// Allow-list of state names; empty means all states.
    pub state_filter: &'a [String],
    /// Inclusive `[lo, hi]` year range.
    pub year_range: Option<(u32, u32)>,
    pub max_retries: i64,
    pub failure_counts: &'a BTreeMap<String, i64>,
    pub inflight: &'a BTreeSet<String>,
    pub batch_size_limit: usize,
}

/// Result of one scan pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Runnable keys in `(state, school, year, page)` order, truncated
    /// at `batch_size_limit`.
    pub runnable: Vec<RecordKey>,
    /// Labelled pages that survived the state/year filters.
    pub total_candidates: usize,
}

/// Derive the next runnable wave.
///
/// Guarantees for every returned key: its label file exists, no output
/// file exists, it is not in flight, its failure count is at most
/// `max_retries`, and its chain dependency is met.
#[must_use]
pub fn scan_runnable_pages(params: &ScanParams<'_>) -> ScanOutcome {
    let books = enumerate_books(params);

    let mut runnable: Vec<RecordKey> = Vec::new();
    let mut total_candidates = 0usize;

    'books: for (book, pages) in books {
        // The virtual predecessor of the first labelled page is Done.
        let mut dependency_done = true;

        for page in pages {
            total_candidates += 1;
            let key = match RecordKey::new(book.state.clone(), book.school.clone(), book.year, page)
            {
                Ok(key) => key,
                Err(e) => {
                    // Unreachable after enumeration filtering, but an
                    // invalid key must never leave the scanner.
                    tracing::warn!(book = %book, page, error = %e, "Skipping invalid record key");
                    dependency_done = false;
                    continue;
                }
            };

            if key.output_path(params.output_root).exists() {
                // Done: skipped, and it satisfies the next page's dependency.
                dependency_done = true;
                continue;
            }

            let serialized = key.to_string();
            let count = params
                .failure_counts
                .get(&serialized)
                .copied()
                .unwrap_or(0);
            if count > params.max_retries {
                // Dead letter: skipped until an operator resets the counter.
                dependency_done = false;
                continue;
            }

            if params.inflight.contains(&serialized) {
                dependency_done = false;
                continue;
            }

            if dependency_done {
                runnable.push(key);
                if runnable.len() >= params.batch_size_limit {
                    break 'books;
                }
                // The page just emitted is not Done yet, so its
                // successor is blocked in this wave.
                dependency_done = false;
            } else {
                // Blocked: nothing later in this book can run.
                continue 'books;
            }
        }
    }

    ScanOutcome {
        runnable,
        total_candidates,
    }
}

/// Enumerate label files into per-book sorted page sets, applying the
/// state and year filters. Path components that fail to parse are
/// skipped with a warning; they never abort the scan.
fn enumerate_books(params: &ScanParams<'_>) -> BTreeMap<BookId, BTreeSet<u32>> {
    let mut books: BTreeMap<BookId, BTreeSet<u32>> = BTreeMap::new();

    for state_entry in read_dir_sorted(params.label_root) {
        let Some(state) = dir_name(&state_entry) else {
            continue;
        };
        if !params.state_filter.is_empty() && !params.state_filter.iter().any(|s| s == &state) {
            continue;
        }

        for school_entry in read_dir_sorted(&state_entry) {
            let Some(school) = dir_name(&school_entry) else {
                continue;
            };

            for year_entry in read_dir_sorted(&school_entry) {
                let Some(year_name) = dir_name(&year_entry) else {
                    continue;
                };
                let Ok(year) = year_name.parse::<u32>() else {
                    tracing::warn!(
                        path = %year_entry.display(),
                        "Skipping label directory with non-numeric year"
                    );
                    continue;
                };
                if year == 0 {
                    tracing::warn!(
                        path = %year_entry.display(),
                        "Skipping label directory with year 0"
                    );
                    continue;
                }
                if let Some((lo, hi)) = params.year_range {
                    if year < lo || year > hi {
                        continue;
                    }
                }

                for page_entry in read_dir_sorted(&year_entry) {
                    let Some(stem) = page_entry
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.strip_suffix(".json"))
                    else {
                        continue;
                    };
                    let Ok(page) = stem.parse::<u32>() else {
                        tracing::warn!(
                            path = %page_entry.display(),
                            "Skipping label file with non-numeric page"
                        );
                        continue;
                    };
                    if page == 0 || state.contains(':') || school.contains(':') {
                        tracing::warn!(
                            path = %page_entry.display(),
                            "Skipping label file with invalid key components"
                        );
                        continue;
                    }

                    books
                        .entry(BookId {
                            state: state.clone(),
                            school: school.clone(),
                            year,
                        })
                        .or_default()
                        .insert(page);
                }
            }
        }
    }

    books
}

/// Child paths of `dir` in name order; unreadable directories yield an
/// empty list with a warning.
fn read_dir_sorted(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut paths: Vec<_> = entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .collect();
            paths.sort();
            paths
        }
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "Cannot read label directory");
            Vec::new()
        }
    }
}

fn dir_name(path: &Path) -> Option<String> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
}
