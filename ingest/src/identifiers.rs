use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

const MAX_IDENTIFIER_LEN: usize = 128;

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"[^A-Za-z0-9_]").expect("invalid identifier regex");
    static ref REPEAT_UNDERSCORE: Regex = Regex::new(r"_+").expect("invalid repeat-underscore regex");
}

///
/// Derive a unique `TB_<name>` table identifier from a source file name, resolving collisions
/// against `existing` per §4.4. Stateless between calls - callers own the running name set.
///
pub fn sanitize_table_name(file_path: &Path, existing: &HashSet<String>) -> String {
    let stem = file_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let cleaned = clean_identifier(&stem);

    let base = if cleaned.is_empty() {
        format!("TABLE_{}", timestamp())
    } else if starts_with_digit(&cleaned) {
        format!("T_{}", cleaned)
    } else {
        cleaned
    };

    let base = truncate(&base, MAX_IDENTIFIER_LEN - 3); // room for "TB_" prefix.
    let candidate = format!("TB_{}", base);

    if !existing.contains(&candidate) {
        return candidate;
    }

    log::debug!("table name {} collides with an existing table, numbering it", candidate);
    for n in 1..=99u8 {
        let attempt = format!("{:02}_{}", n, candidate);
        if !existing.contains(&attempt) {
            return attempt;
        }
    }

    format!("{}_{}", timestamp(), candidate)
}

///
/// Derive a unique, valid column identifier. `accepted_so_far` is used both to detect collisions
/// and to number anonymous `COL<NNN>` columns.
///
pub fn sanitize_column_name(raw: &str, accepted_so_far: &[String]) -> String {
    let cleaned = clean_identifier(raw);

    let base = if cleaned.is_empty() {
        format!("COL{:03}", accepted_so_far.len() + 1)
    } else if starts_with_digit(&cleaned) {
        format!("C_{}", cleaned)
    } else {
        cleaned
    };

    let base = truncate(&base, MAX_IDENTIFIER_LEN);

    if !accepted_so_far.contains(&base) {
        return base;
    }

    let mut suffix = 2u32;
    loop {
        let candidate = with_suffix(&base, suffix);
        if !accepted_so_far.contains(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

fn with_suffix(base: &str, suffix: u32) -> String {
    let tail = format!("_{}", suffix);
    let trimmed = truncate(base, MAX_IDENTIFIER_LEN - tail.len());
    format!("{}{}", trimmed, tail)
}

///
/// Replace non-word characters with `_`, collapse runs, and trim leading/trailing underscores.
///
fn clean_identifier(raw: &str) -> String {
    let replaced = NON_WORD.replace_all(raw, "_");
    let collapsed = REPEAT_UNDERSCORE.replace_all(&replaced, "_");
    collapsed.trim_matches('_').to_string()
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}
