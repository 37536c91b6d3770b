//! POSIX shell quoting

/// Wrap `s` in single quotes so a POSIX shell reads it as one literal word.
///
/// Embedded single quotes become `'\''` (close, escaped quote, reopen), which
/// keeps the result valid no matter how many times it is nested.
#[must_use]
pub fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote `s` only if a shell would otherwise split or expand it
///
/// For short words such as user names and umasks, where the bare form reads
/// better in logs.
#[must_use]
pub fn quote_word(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | ',' | '=')
        });
    if plain { s.to_string() } else { quote(s) }
}

/// Read one shell word from the start of `s`
///
/// Understands bare characters, single-quoted runs and backslash escapes,
/// which covers everything [`quote`] and [`quote_word`] produce. Returns the
/// unquoted word and the unread rest (starting at the separating space), or
/// `None` for an empty or unterminated word.
#[must_use]
pub fn split_word(s: &str) -> Option<(String, &str)> {
    let mut word = String::new();
    let mut seen = false;
    let mut chars = s.char_indices();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\'' => {
                seen = true;
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, c)) => word.push(c),
                        None => return None,
                    }
                }
            }
            '\\' => {
                seen = true;
                word.push(chars.next()?.1);
            }
            c if c.is_whitespace() => return seen.then_some((word, &s[idx..])),
            c => {
                seen = true;
                word.push(c);
            }
        }
    }
    seen.then_some((word, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("production"), "'production'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("$HOME `id`"), "'$HOME `id`'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("''"), r"''\'''\'''");
    }

    #[test]
    fn test_quote_word() {
        assert_eq!(quote_word("deploy"), "deploy");
        assert_eq!(quote_word("0022"), "0022");
        assert_eq!(quote_word("www data"), "'www data'");
        assert_eq!(quote_word(""), "''");
        assert_eq!(quote_word("a;rm"), "'a;rm'");
    }

    #[test]
    fn test_split_word_reverses_quote() {
        for raw in ["plain", "a b", "it's", "''", "x && y", ""] {
            let quoted = quote(raw);
            assert_eq!(split_word(&quoted), Some((raw.to_string(), "")));
        }
    }

    #[test]
    fn test_split_word_stops_at_space() {
        assert_eq!(
            split_word("deploy sh -c 'x'"),
            Some(("deploy".to_string(), " sh -c 'x'"))
        );
        assert_eq!(split_word("'open"), None);
        assert_eq!(split_word(" lead"), None);
    }
}
