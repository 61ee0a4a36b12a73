//! Text utilities: shortening, word counts, token-aware splitting and
//! content fingerprints.

use crate::keys::sha256_hex;

/// Approximate chars-per-token ratio used for budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate for a piece of text.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and cut to at most `max_chars` characters,
/// preferring a word boundary and appending `…` when cut.
pub fn shorten(text: &str, max_chars: usize) -> String {
    let collapsed = collapse_whitespace(text);
    if max_chars == 0 {
        return String::new();
    }
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
    let trimmed = match cut.rfind(' ') {
        Some(pos) if pos > cut.len() / 2 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Whitespace- and case-insensitive content fingerprint.
pub fn fingerprint_text(text: &str) -> String {
    sha256_hex(collapse_whitespace(text).to_lowercase().as_bytes())
}

/// Split text on paragraph boundaries into pieces of at most `max_tokens`.
///
/// Paragraphs larger than the budget are hard-split at the last newline
/// or space before the limit. Returns no pieces for blank input.
pub fn split_by_tokens(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let mut split_at = remaining.len().min(max_chars);
                while !remaining.is_char_boundary(split_at) {
                    split_at -= 1;
                }
                let actual = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Group items into consecutive batches whose estimated token total stays
/// under `max_tokens` (a single oversized item still gets its own batch)
/// and whose length never exceeds `max_items`.
pub fn batch_by_tokens<T, F>(items: Vec<T>, max_tokens: usize, max_items: usize, measure: F) -> Vec<Vec<T>>
where
    F: Fn(&T) -> usize,
{
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for item in items {
        let cost = measure(&item);
        if !current.is_empty() && (used + cost > max_tokens || current.len() >= max_items) {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("  hello \n world ", 50), "hello world");
        let s = shorten("alpha beta gamma delta epsilon", 14);
        assert!(s.chars().count() <= 14, "{}", s);
        assert!(s.ends_with('…'));
        assert_eq!(shorten("anything", 0), "");
    }

    #[test]
    fn test_shorten_multibyte() {
        let s = shorten(&"é".repeat(40), 10);
        assert_eq!(s.chars().count(), 10);
    }

    #[test]
    fn test_fingerprint_ignores_case_and_spacing() {
        assert_eq!(fingerprint_text("Hello   World"), fingerprint_text("hello world\n"));
        assert_ne!(fingerprint_text("hello"), fingerprint_text("world"));
    }

    #[test]
    fn test_split_by_tokens_respects_budget() {
        let text = (0..30)
            .map(|i| format!("Paragraph number {} has a few words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let pieces = split_by_tokens(&text, 20);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.len() <= 80, "piece too long: {}", p.len());
        }
        assert!(split_by_tokens("  \n\n ", 10).is_empty());
    }

    #[test]
    fn test_batch_by_tokens() {
        let items = vec![10usize, 10, 10, 50, 5];
        let batches = batch_by_tokens(items, 25, 10, |n| *n);
        assert_eq!(batches, vec![vec![10, 10], vec![10], vec![50], vec![5]]);

        let batches = batch_by_tokens(vec![1usize; 5], 100, 2, |n| *n);
        assert_eq!(batches.len(), 3);
    }
}
