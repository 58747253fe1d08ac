use crate::model::Snippet;

/// Maximum number of characters in a snippet.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 240;

/// Minimum length for a prefix relation between two words to count as a match.
const MIN_STEM_LEN: usize = 3;

/// Iterate over alphanumeric runs in `text` as `(byte_offset, word)`.
pub fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut iter = text.char_indices().peekable();
    std::iter::from_fn(move || {
        while let Some(&(_, c)) = iter.peek() {
            if c.is_alphanumeric() {
                break;
            }
            iter.next();
        }
        let (start, _) = *iter.peek()?;
        let mut end = start;
        while let Some(&(idx, c)) = iter.peek() {
            if !c.is_alphanumeric() {
                break;
            }
            end = idx + c.len_utf8();
            iter.next();
        }
        Some((start, &text[start..end]))
    })
}

/// Lower-cased words of `text`, in order.
pub fn lowercase_words(text: &str) -> Vec<String> {
    words(text).map(|(_, w)| w.to_lowercase()).collect()
}

/// Whether a lower-cased word in a document matches a query term.
///
/// Accepts equality and a shared stem where one word extends the other
/// (`tree`/`trees`), which mirrors what the stemming analyzer matched.
pub fn word_matches(word: &str, term: &str) -> bool {
    if word == term {
        return true;
    }
    let (short, long) = if word.len() < term.len() {
        (word, term)
    } else {
        (term, word)
    };
    short.chars().count() >= MIN_STEM_LEN
        && long.starts_with(short)
        && long.chars().count() - short.chars().count() <= 2
}

/// Build a snippet around the first occurrence of any query term.
///
/// Falls back to the head of the text when nothing matches.
pub fn build_snippet(text: &str, terms: &[String], max_chars: usize) -> Snippet {
    build_snippet_with(text, max_chars, |word| {
        terms.iter().any(|t| word_matches(word, t))
    })
}

/// Build a snippet highlighting every word accepted by `is_match`.
///
/// `is_match` receives lower-cased words; highlights keep original casing
/// because they are byte ranges into the untouched text.
pub fn build_snippet_with(
    text: &str,
    max_chars: usize,
    is_match: impl Fn(&str) -> bool,
) -> Snippet {
    let matches: Vec<(usize, usize)> = words(text)
        .filter(|(_, w)| is_match(&w.to_lowercase()))
        .map(|(start, w)| (start, start + w.len()))
        .collect();

    let anchor = matches.first().map(|m| m.0).unwrap_or(0);
    let (start, end) = window(text, anchor, max_chars.max(1));

    let highlights = matches
        .into_iter()
        .filter(|(s, e)| *s >= start && *e <= end)
        .map(|(s, e)| (s - start, e - start))
        .collect();

    Snippet {
        text: text[start..end].to_string(),
        highlights,
        confidence: None,
    }
}

/// Pick a `[start, end)` byte window of at most `max_chars` characters that
/// contains `anchor`, snapped to whitespace where possible.
fn window(text: &str, anchor: usize, max_chars: usize) -> (usize, usize) {
    let lead = max_chars / 4;

    let mut start = anchor;
    for (count, (idx, _)) in text[..anchor].char_indices().rev().enumerate() {
        if count >= lead {
            break;
        }
        start = idx;
    }
    if start > 0
        && let Some((ws, c)) = text[start..anchor]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
    {
        start += ws + c.len_utf8();
    }

    let mut end = text.len();
    if let Some((idx, _)) = text[start..].char_indices().nth(max_chars) {
        end = start + idx;
        if let Some(ws) = text[anchor..end].rfind(char::is_whitespace)
            && anchor + ws > start
        {
            end = anchor + ws;
        }
    }

    (start, end)
}
