//! Overflow truncation.
//!
//! Budgets normally keep a gather under `max_tokens`; this is the backstop
//! when they don't. Items are ranked by
//! [`ContextItemType::truncation_priority`](crate::models::ContextItemType::truncation_priority)
//! (stable, so equal ranks keep gather order) and admitted until the first
//! one that would overflow. That item and everything ranked after it are
//! dropped, so a lower-ranked item never survives a higher-ranked one.

use crate::models::ContextItem;

#[derive(Debug, Clone, Default)]
pub struct Truncation {
    pub kept: Vec<ContextItem>,
    /// Keys of dropped items, in rank order.
    pub dropped: Vec<String>,
    pub total_tokens: usize,
}

pub fn truncate_to_budget(mut items: Vec<ContextItem>, max_tokens: usize) -> Truncation {
    items.sort_by_key(|item| std::cmp::Reverse(item.item_type.truncation_priority()));

    let mut out = Truncation::default();
    let mut full = false;
    for item in items {
        if !full && out.total_tokens + item.tokens <= max_tokens {
            out.total_tokens += item.tokens;
            out.kept.push(item);
        } else {
            full = true;
            out.dropped.push(item.key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextItemType;

    fn item(key: &str, item_type: ContextItemType, tokens: usize) -> ContextItem {
        ContextItem {
            key: key.to_string(),
            content: String::new(),
            item_type,
            tokens,
            entity: None,
        }
    }

    fn keys(items: &[ContextItem]) -> Vec<&str> {
        items.iter().map(|i| i.key.as_str()).collect()
    }

    #[test]
    fn fits_untouched() {
        let t = truncate_to_budget(vec![item("a", ContextItemType::Block, 5)], 5);
        assert_eq!(keys(&t.kept), vec!["a"]);
        assert!(t.dropped.is_empty());
    }

    #[test]
    fn ranks_by_type_then_gather_order() {
        let items = vec![
            item("src", ContextItemType::Source, 10),
            item("recent1", ContextItemType::Recent, 10),
            item("man", ContextItemType::Manual, 10),
            item("linked", ContextItemType::Linked, 10),
            item("sem", ContextItemType::Semantic, 10),
        ];
        let t = truncate_to_budget(items, 35);
        assert_eq!(keys(&t.kept), vec!["man", "sem", "recent1"]);
        assert_eq!(t.dropped, vec!["linked", "src"]);
        assert_eq!(t.total_tokens, 30);
    }

    #[test]
    fn manual_outlives_sources() {
        let items = vec![
            item("b1", ContextItemType::Block, 1),
            item("m1", ContextItemType::Manual, 6),
            item("m2", ContextItemType::Manual, 6),
        ];
        let t = truncate_to_budget(items, 10);
        assert_eq!(keys(&t.kept), vec!["m1"]);
        // the block would fit, but a manual item was already cut
        assert_eq!(t.dropped, vec!["m2", "b1"]);
    }
}
