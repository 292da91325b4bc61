//! Term matching over mixed Chinese and English questions.
//!
//! Offsets are byte offsets into the lowercased text. ASCII terms only match
//! on word boundaries (a trailing plural `s` is allowed); CJK terms match anywhere.

/// A question and its lowercased form
pub struct TextScan<'a> {
    original: &'a str,
    lower: String,
}

impl<'a> TextScan<'a> {
    pub fn new(original: &'a str) -> Self {
        Self {
            original,
            lower: original.to_lowercase(),
        }
    }

    pub fn lower(&self) -> &str {
        &self.lower
    }

    /// Slice of the original text when lowercasing kept byte offsets stable
    pub fn original_slice(&self, start: usize, end: usize) -> &str {
        let source = if self.original.len() == self.lower.len() {
            self.original
        } else {
            self.lower.as_str()
        };
        source.get(start..end).unwrap_or("")
    }
}

pub fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}')
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn boundary_ok(haystack: &str, start: usize, end: usize, term: &str) -> bool {
    let first = term.chars().next();
    let last = term.chars().last();
    if first.is_some_and(is_word_char) {
        if let Some(prev) = haystack[..start].chars().next_back() {
            if is_word_char(prev) {
                return false;
            }
        }
    }
    if last.is_some_and(is_word_char) {
        let mut rest = haystack[end..].chars();
        match rest.next() {
            Some('s') => {
                if rest.next().is_some_and(is_word_char) {
                    return false;
                }
            }
            Some(c) if is_word_char(c) => return false,
            _ => {}
        }
    }
    true
}

/// All match offsets of `term` in `haystack`
pub fn find_term(haystack: &str, term: &str) -> Vec<usize> {
    if term.is_empty() {
        return Vec::new();
    }
    haystack
        .match_indices(term)
        .map(|(i, _)| i)
        .filter(|&i| boundary_ok(haystack, i, i + term.len(), term))
        .collect()
}

pub fn first_term(haystack: &str, term: &str) -> Option<usize> {
    find_term(haystack, term).into_iter().next()
}

pub fn contains_term(haystack: &str, term: &str) -> bool {
    first_term(haystack, term).is_some()
}

pub fn starts_with_term(text: &str, term: &str) -> bool {
    !term.is_empty() && text.starts_with(term) && boundary_ok(text, 0, term.len(), term)
}

/// Longest term from `terms` that `text` starts with
pub fn leading_match<'t>(text: &str, terms: &'t [String]) -> Option<&'t str> {
    terms
        .iter()
        .filter(|t| !t.is_empty() && text.starts_with(t.as_str()))
        .filter(|t| boundary_ok(text, 0, t.len(), t))
        .max_by_key(|t| t.len())
        .map(|t| t.as_str())
}

/// Leading run of CJK characters or of an ASCII word, stopping before any of `stops`
pub fn leading_word<'t>(text: &'t str, stops: &[&str]) -> &'t str {
    let mut end = 0;
    let mut cjk_run: Option<bool> = None;
    for (i, c) in text.char_indices() {
        if i > 0 && stops.iter().any(|s| !s.is_empty() && text[i..].starts_with(s)) {
            break;
        }
        let cjk = is_cjk(c);
        let word = is_word_char(c) || c == '-' || c == '.';
        if !(cjk || word) {
            break;
        }
        match cjk_run {
            None => cjk_run = Some(cjk),
            Some(run) if run != cjk => break,
            _ => {}
        }
        end = i + c.len_utf8();
    }
    text[..end].trim_end_matches(['-', '.'])
}

/// Strip leading filler between a column name and what follows it
pub fn skip_filler(text: &str) -> &str {
    let mut rest = text.trim_start();
    loop {
        let before = rest;
        for filler in ["的", "of ", "the "] {
            if let Some(stripped) = rest.strip_prefix(filler) {
                rest = stripped.trim_start();
            }
        }
        if rest.len() == before.len() {
            return rest;
        }
    }
}
