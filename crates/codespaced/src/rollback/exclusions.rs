//! Glob exclusion patterns for snapshot restores
//!
//! Paths are matched relative to the rollback root with `/` separators.
//! A pattern without `/` matches any single path component (`*.log`,
//! `node_modules`); a pattern with `/` is anchored at the root
//! (`storage/cache/**`). Excluding a directory excludes everything below it.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Component, Path};

#[derive(Debug, Clone)]
struct Pattern {
    anchored: bool,
    regex: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<Pattern>,
}

impl ExclusionSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let trimmed = raw.trim().trim_start_matches('/').trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            let regex = Regex::new(&glob_to_regex(trimmed))
                .with_context(|| format!("Invalid exclude pattern '{}'", raw))?;
            compiled.push(Pattern {
                anchored: trimmed.contains('/'),
                regex,
            });
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        let components: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if components.is_empty() {
            return false;
        }

        self.patterns.iter().any(|pattern| {
            if pattern.anchored {
                // the path itself or any ancestor directory
                (1..=components.len())
                    .any(|n| pattern.regex.is_match(&components[..n].join("/")))
            } else {
                components.iter().any(|part| pattern.regex.is_match(part))
            }
        })
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    regex.push_str("(?:.*/)?");
                } else {
                    regex.push_str(".*");
                }
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }

    regex.push('$');
    regex
}
