//! Search result excerpts.

/// Longest excerpt, in characters, before ellipsis trimming.
const EXCERPT_CHARS: usize = 500;

/// Build an excerpt of `content` centered on the first occurrence of
/// any term, with every term occurrence wrapped in `<em>…</em>`.
/// Matching is case-insensitive; `…` marks trimmed boundaries.
pub fn excerpt(content: &str, terms: &[String]) -> String {
    let lowered = content.to_lowercase();
    let lowered_terms: Vec<String> = terms
        .iter()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let first = lowered_terms
        .iter()
        .filter_map(|t| lowered.find(t.as_str()))
        .min()
        .unwrap_or(0);

    let (start, end) = window(content, first, EXCERPT_CHARS);
    let slice = &content[start..end];
    let highlighted = highlight(slice, &lowered_terms);

    let mut out = String::with_capacity(highlighted.len() + 8);
    if start > 0 {
        out.push('…');
    }
    out.push_str(&highlighted);
    if end < content.len() {
        out.push('…');
    }
    out
}

/// A window of roughly `max_chars` characters around `center_byte`,
/// clamped to the string and to char boundaries.
fn window(content: &str, center_byte: usize, max_chars: usize) -> (usize, usize) {
    if content.chars().count() <= max_chars {
        return (0, content.len());
    }
    let half = max_chars / 2;

    // Walk back `half` characters from the match.
    let mut start = center_byte.min(content.len());
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut taken = 0;
    while start > 0 && taken < half {
        start -= 1;
        while !content.is_char_boundary(start) {
            start -= 1;
        }
        taken += 1;
    }

    let mut end = start;
    let mut count = 0;
    for (offset, ch) in content[start..].char_indices() {
        if count == max_chars {
            end = start + offset;
            break;
        }
        count += 1;
        end = start + offset + ch.len_utf8();
    }
    (start, end)
}

/// Wrap every case-insensitive occurrence of any term in `<em>` tags.
fn highlight(slice: &str, lowered_terms: &[String]) -> String {
    let lowered = slice.to_lowercase();
    // Collect non-overlapping match ranges, longest term first so a
    // shorter term never splits a longer one.
    let mut terms: Vec<&String> = lowered_terms.iter().collect();
    terms.sort_by_key(|t| std::cmp::Reverse(t.len()));

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for term in terms {
        let mut from = 0;
        while let Some(found) = lowered[from..].find(term.as_str()) {
            let begin = from + found;
            let finish = begin + term.len();
            if !ranges.iter().any(|(s, e)| begin < *e && finish > *s) {
                ranges.push((begin, finish));
            }
            from = finish;
        }
    }
    ranges.sort_unstable();

    let mut out = String::with_capacity(slice.len() + ranges.len() * 9);
    let mut cursor = 0;
    for (begin, finish) in ranges {
        // Lowercasing can change byte lengths for some characters;
        // skip any range that no longer lines up with the original.
        if begin < cursor
            || finish > slice.len()
            || !slice.is_char_boundary(begin)
            || !slice.is_char_boundary(finish)
        {
            continue;
        }
        out.push_str(&slice[cursor..begin]);
        out.push_str("<em>");
        out.push_str(&slice[begin..finish]);
        out.push_str("</em>");
        cursor = finish;
    }
    out.push_str(&slice[cursor..]);
    out
}
