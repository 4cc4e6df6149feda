//! Token budget allocation across strategies.

use std::collections::HashMap;

/// Per-strategy budgets for `strategies`, given as `(name, priority)` in
/// invocation order. The returned vector is aligned with the input.
///
/// Custom budgets are honored first, each capped by what is left of
/// `max_tokens`. The remainder is split among the other strategies in
/// proportion to priority, rounding down; tokens lost to rounding stay
/// unallocated. When every uncustomized priority is zero the remainder is
/// split evenly instead.
pub fn allocate_budgets(
    strategies: &[(&str, u32)],
    max_tokens: usize,
    custom: &HashMap<String, usize>,
) -> Vec<usize> {
    let mut budgets = vec![0usize; strategies.len()];
    let mut remaining = max_tokens;

    for (i, (name, _)) in strategies.iter().enumerate() {
        if let Some(&requested) = custom.get(*name) {
            let granted = requested.min(remaining);
            budgets[i] = granted;
            remaining -= granted;
        }
    }

    let open: Vec<usize> = (0..strategies.len())
        .filter(|i| !custom.contains_key(strategies[*i].0))
        .collect();
    if open.is_empty() {
        return budgets;
    }

    let weight_sum: u64 = open.iter().map(|i| strategies[*i].1 as u64).sum();
    for i in &open {
        budgets[*i] = if weight_sum == 0 {
            remaining / open.len()
        } else {
            (remaining as u64 * strategies[*i].1 as u64 / weight_sum) as usize
        };
    }

    budgets
}
