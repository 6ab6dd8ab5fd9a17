//! Minimal `.env` loading.
//!
//! `KEY=VALUE` lines are applied to the process environment only when
//! the variable is not already set, so real environment always wins.

use std::path::Path;

/// Load a dotenv file if it exists. Missing files are not an error.
pub fn load(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('\'').trim_matches('"');
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
}
