//! Shard pattern expansion
//!
//! Supports `::`-separated pattern lists, brace lists (`{a,b}`), numeric and
//! character ranges (`{000..099}`, `{0..10..2}`, `{a..e}`) and, for local
//! paths, glob wildcards.

use crate::error::{PipelineError, Result};

/// Expand a shard pattern into concrete shard locations, in order.
///
/// An empty expansion is a configuration error.
pub fn expand_pattern(pattern: &str) -> Result<Vec<String>> {
    let mut urls = Vec::new();

    for part in pattern.split("::").map(str::trim).filter(|p| !p.is_empty()) {
        let expanded = brace_expand(part).map_err(|reason| PipelineError::InvalidShardPattern {
            pattern: pattern.to_string(),
            reason,
        })?;

        for item in expanded {
            if is_remote(&item) || !has_glob_meta(&item) {
                urls.push(item);
                continue;
            }
            urls.extend(expand_glob(pattern, &item)?);
        }
    }

    if urls.is_empty() {
        return Err(PipelineError::EmptyShardPattern {
            pattern: pattern.to_string(),
        });
    }

    Ok(urls)
}

/// True for URLs fetched over the network
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn has_glob_meta(item: &str) -> bool {
    item.contains(['*', '?', '['])
}

fn expand_glob(pattern: &str, item: &str) -> Result<Vec<String>> {
    let paths = glob::glob(item).map_err(|e| PipelineError::InvalidShardPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut matches: Vec<String> = paths
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Expand every brace group in `pattern`, left to right.
pub fn brace_expand(pattern: &str) -> std::result::Result<Vec<String>, String> {
    let Some(open) = pattern.find('{') else {
        if pattern.contains('}') {
            return Err("unbalanced '}'".into());
        }
        return Ok(vec![pattern.to_string()]);
    };

    let close = matching_brace(pattern, open).ok_or_else(|| "unbalanced '{'".to_string())?;
    let prefix = &pattern[..open];
    let inner = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    if prefix.contains('}') {
        return Err("unbalanced '}'".into());
    }

    let parts = split_top_level(inner);
    let alternatives: Vec<String> = if parts.len() > 1 {
        let mut alts = Vec::new();
        for part in parts {
            alts.extend(brace_expand(part)?);
        }
        alts
    } else if let Some(range) = expand_range(inner)? {
        range
    } else {
        brace_expand(inner)?
            .into_iter()
            .map(|literal| format!("{{{}}}", literal))
            .collect()
    };

    let rest = brace_expand(suffix)?;
    let mut out = Vec::with_capacity(alternatives.len() * rest.len());
    for alt in &alternatives {
        for tail in &rest {
            out.push(format!("{}{}{}", prefix, alt, tail));
        }
    }
    Ok(out)
}

fn matching_brace(pattern: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in pattern[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in inner.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&inner[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

/// `a..b` or `a..b..step`; `None` when `inner` is not a range.
fn expand_range(inner: &str) -> std::result::Result<Option<Vec<String>>, String> {
    let fields: Vec<&str> = inner.split("..").collect();
    if fields.len() != 2 && fields.len() != 3 {
        return Ok(None);
    }

    let step = match fields.get(2) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(0) => return Err(format!("zero step in range {{{}}}", inner)),
            Ok(step) => step.unsigned_abs(),
            Err(_) => return Ok(None),
        },
        None => 1,
    };

    let (start, end) = (fields[0], fields[1]);
    if let (Ok(lo), Ok(hi)) = (start.parse::<i64>(), end.parse::<i64>()) {
        let padded = |s: &str| s.len() > 1 && s.trim_start_matches('-').starts_with('0');
        let width = if padded(start) || padded(end) {
            start.len().max(end.len())
        } else {
            0
        };
        let values = stepped(lo, hi, step);
        return Ok(Some(
            values
                .into_iter()
                .map(|v| format!("{:0width$}", v, width = width))
                .collect(),
        ));
    }

    let mut start_chars = start.chars();
    let mut end_chars = end.chars();
    if let (Some(a), None, Some(b), None) = (
        start_chars.next(),
        start_chars.next(),
        end_chars.next(),
        end_chars.next(),
    ) {
        let values = stepped(a as i64, b as i64, step);
        return Ok(Some(
            values
                .into_iter()
                .filter_map(|v| char::from_u32(v as u32))
                .map(String::from)
                .collect(),
        ));
    }

    Ok(None)
}

fn stepped(lo: i64, hi: i64, step: u64) -> Vec<i64> {
    let step = step as usize;
    if lo <= hi {
        (lo..=hi).step_by(step).collect()
    } else {
        (hi..=lo).rev().step_by(step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_padded_range() {
        let urls = brace_expand("shard-{000..003}.tar").unwrap();
        assert_eq!(
            urls,
            vec![
                "shard-000.tar",
                "shard-001.tar",
                "shard-002.tar",
                "shard-003.tar"
            ]
        );
    }

    #[test]
    fn test_list_and_nested() {
        let urls = brace_expand("{train,val}/part-{1..2}.tar").unwrap();
        assert_eq!(
            urls,
            vec![
                "train/part-1.tar",
                "train/part-2.tar",
                "val/part-1.tar",
                "val/part-2.tar"
            ]
        );

        let nested = brace_expand("x{a,b{1,2}}").unwrap();
        assert_eq!(nested, vec!["xa", "xb1", "xb2"]);
    }

    #[test]
    fn test_step_and_descending() {
        assert_eq!(brace_expand("{0..6..3}").unwrap(), vec!["0", "3", "6"]);
        assert_eq!(brace_expand("{3..1}").unwrap(), vec!["3", "2", "1"]);
        assert_eq!(brace_expand("{a..c}").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_literal_braces_and_errors() {
        assert_eq!(brace_expand("{solo}").unwrap(), vec!["{solo}"]);
        assert!(brace_expand("shard-{000..003.tar").is_err());
        assert!(brace_expand("shard-}.tar").is_err());
    }

    #[test]
    fn test_multiple_patterns() {
        let urls = expand_pattern("a-{0..1}.tar::https://host/b.tar").unwrap();
        assert_eq!(urls, vec!["a-0.tar", "a-1.tar", "https://host/b.tar"]);
    }

    #[test]
    fn test_empty_glob_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.tar", dir.path().display());
        let err = expand_pattern(&pattern).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_glob_matches_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tar", "a.tar", "c.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let pattern = format!("{}/*.tar", dir.path().display());
        let urls = expand_pattern(&pattern).unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("a.tar"));
        assert!(urls[1].ends_with("b.tar"));
    }
}
