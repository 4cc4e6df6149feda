//! Markdown splitting into entities.
//!
//! A source file becomes one source entity (key = its vault path) plus one
//! block per ATX heading. Block keys nest: a `## Setup` under `# Guide` in
//! `notes/a.md` is `notes/a.md#Guide#Setup`. Block content runs from the
//! heading line up to the next heading of any level. Headings inside
//! fenced code are ignored.
//!
//! Content hashes are SHA-256 hex digests of the entity content.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::models::BLOCK_DELIMITER;
use crate::store::Entity;

/// A source entity and the blocks carved out of it.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub source: Entity,
    pub blocks: Vec<Entity>,
}

impl ParsedSource {
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        std::iter::once(&self.source).chain(self.blocks.iter())
    }

    pub fn into_entities(self) -> Vec<Entity> {
        let mut all = Vec::with_capacity(self.blocks.len() + 1);
        all.push(self.source);
        all.extend(self.blocks);
        all
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn parse_source(source_path: &str, body: &str, modified_at: DateTime<Utc>) -> ParsedSource {
    let make = |key: String, content: &str| Entity {
        key,
        source_path: source_path.to_string(),
        content: content.to_string(),
        content_hash: content_hash(content),
        modified_at,
        links: extract_links(source_path, content),
        embedding: None,
    };

    let source = make(source_path.to_string(), body);

    let mut blocks = Vec::new();
    // (level, name) of enclosing headings
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut used: HashSet<String> = HashSet::new();
    let mut current: Option<(String, String)> = None;
    let mut in_fence = false;

    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let heading = if in_fence { None } else { parse_heading(line) };

        if let Some((level, name)) = heading {
            if let Some((key, text)) = current.take() {
                blocks.push(make(key, text.trim_end()));
            }
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, name));

            let mut key = source_path.to_string();
            for (_, part) in &stack {
                key.push(BLOCK_DELIMITER);
                key.push_str(part);
            }
            if used.contains(&key) {
                // a literal "Name (2)" heading may already hold the suffix
                let mut n = 2;
                while used.contains(&format!("{key} ({n})")) {
                    n += 1;
                }
                key = format!("{key} ({n})");
            }
            used.insert(key.clone());
            current = Some((key, format!("{line}\n")));
        } else if let Some((_, text)) = current.as_mut() {
            text.push_str(line);
            text.push('\n');
        }
    }

    if let Some((key, text)) = current {
        blocks.push(make(key, text.trim_end()));
    }

    ParsedSource { source, blocks }
}

/// `## Title ##` → `(2, "Title")`. The delimiter character is stripped
/// from the name so it cannot split the key.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let name: String = rest
        .trim()
        .trim_end_matches('#')
        .trim()
        .chars()
        .filter(|c| *c != BLOCK_DELIMITER)
        .collect();
    if name.is_empty() {
        return None;
    }
    Some((hashes, name))
}

/// Link targets in `text`, as vault-relative source paths.
///
/// `[[Note]]`, `[[Note|alias]]` and `[[dir/Note#Heading]]` resolve to
/// `Note.md` / `dir/Note.md`. Markdown links `[t](../x.md)` resolve
/// relative to the linking file. External URLs are skipped.
pub fn extract_links(source_path: &str, text: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut push = |link: String| {
        if !link.is_empty() && link != source_path && !links.contains(&link) {
            links.push(link);
        }
    };

    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else { break };
        let inner = &after[..end];
        let target = inner.split(['|', BLOCK_DELIMITER]).next().unwrap_or("").trim();
        if !target.is_empty() {
            push(with_md_extension(target));
        }
        rest = &after[end + 2..];
    }

    let mut rest = text;
    while let Some(start) = rest.find("](") {
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else { break };
        let target = after[..end].trim();
        rest = &after[end + 1..];
        if target.contains("://") || target.starts_with("mailto:") || target.starts_with('#') {
            continue;
        }
        let target = target.split(BLOCK_DELIMITER).next().unwrap_or("");
        let target = target.replace("%20", " ");
        if let Some(resolved) = resolve_relative(source_path, &target) {
            push(resolved);
        }
    }

    links
}

fn with_md_extension(target: &str) -> String {
    let name = target.rsplit('/').next().unwrap_or(target);
    if name.contains('.') {
        target.to_string()
    } else {
        format!("{target}.md")
    }
}

fn resolve_relative(source_path: &str, target: &str) -> Option<String> {
    if target.is_empty() {
        return None;
    }
    let mut parts: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        let mut dir: Vec<&str> = source_path.split('/').collect();
        dir.pop();
        dir
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // escapes the vault
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(with_md_extension(&parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(parsed: &ParsedSource) -> Vec<&str> {
        parsed.blocks.iter().map(|b| b.key.as_str()).collect()
    }

    #[test]
    fn nested_headings_build_keys() {
        let body = "intro\n# Guide\ntext\n## Setup\nsteps\n## Usage\nrun it\n# Other\n";
        let parsed = parse_source("notes/a.md", body, Utc::now());
        assert_eq!(parsed.source.key, "notes/a.md");
        assert_eq!(
            keys(&parsed),
            vec![
                "notes/a.md#Guide",
                "notes/a.md#Guide#Setup",
                "notes/a.md#Guide#Usage",
                "notes/a.md#Other"
            ]
        );
        assert_eq!(parsed.blocks[1].content, "## Setup\nsteps");
        assert!(parsed.blocks.iter().all(|b| b.source_path == "notes/a.md"));
    }

    #[test]
    fn fenced_code_is_not_a_heading() {
        let body = "# Real\n```sh\n# comment\n```\n";
        let parsed = parse_source("a.md", body, Utc::now());
        assert_eq!(keys(&parsed), vec!["a.md#Real"]);
        assert!(parsed.blocks[0].content.contains("# comment"));
    }

    #[test]
    fn duplicate_headings_get_suffix() {
        let parsed = parse_source("a.md", "# Notes\n1\n# Notes\n2\n", Utc::now());
        assert_eq!(keys(&parsed), vec!["a.md#Notes", "a.md#Notes (2)"]);
    }

    #[test]
    fn suffix_skips_literal_heading_with_same_name() {
        let parsed = parse_source("p.md", "# A
1
# A
2
# A (2)
3
# A
4
", Utc::now());
        assert_eq!(
            keys(&parsed),
            vec!["p.md#A", "p.md#A (2)", "p.md#A (2) (2)", "p.md#A (3)"]
        );
    }

    #[test]
    fn hash_tracks_content() {
        let a = parse_source("a.md", "same", Utc::now());
        let b = parse_source("b.md", "same", Utc::now());
        let c = parse_source("a.md", "different", Utc::now());
        assert_eq!(a.source.content_hash, b.source.content_hash);
        assert_ne!(a.source.content_hash, c.source.content_hash);
        assert_eq!(a.source.content_hash.len(), 64);
    }

    #[test]
    fn links_are_resolved() {
        let text = "See [[Other]] and [[dir/Deep#Part|alias]], [up](../top.md), \
                    [web](https://example.com), [[Other]] again and [anchor](#x).";
        let links = extract_links("notes/a.md", text);
        assert_eq!(links, vec!["Other.md", "dir/Deep.md", "top.md"]);
    }

    #[test]
    fn links_escaping_vault_are_dropped() {
        assert!(extract_links("a.md", "[x](../../out.md)").is_empty());
    }
}
