//! Shell-like tokenization of command input
//!
//! Whitespace separates tokens. Double quotes preserve spaces and honor
//! backslash escapes; backticks are verbatim; `#` outside quotes starts
//! a comment that runs to end of line.

use crate::Error;

pub fn tokenize(input: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '#' => break,
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(Error::UnterminatedQuote(input.to_string())),
                        },
                        Some(c) => current.push(c),
                        None => return Err(Error::UnterminatedQuote(input.to_string())),
                    }
                }
            }
            '`' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('`') => break,
                        Some(c) => current.push(c),
                        None => return Err(Error::UnterminatedQuote(input.to_string())),
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Quote a token so [`tokenize`] reproduces it exactly
pub fn quote(token: &str) -> String {
    if token.is_empty() {
        return "\"\"".to_string();
    }

    let plain = !token
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '`' | '#' | '\\'));
    if plain {
        return token.to_string();
    }

    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("vm launch x").unwrap(), vec!["vm", "launch", "x"]);
        assert_eq!(tokenize("  vm\tlaunch  ").unwrap(), vec!["vm", "launch"]);
    }

    #[test]
    fn double_quotes_preserve_spaces() {
        assert_eq!(
            tokenize("echo \"hello world\"").unwrap(),
            vec!["echo", "hello world"]
        );
    }

    #[test]
    fn backslash_escapes_inside_quotes() {
        assert_eq!(
            tokenize(r#"echo "a \"b\" \\c""#).unwrap(),
            vec!["echo", r#"a "b" \c"#]
        );
    }

    #[test]
    fn backticks_are_verbatim() {
        assert_eq!(
            tokenize(r#"echo `a \"b # c`"#).unwrap(),
            vec!["echo", r#"a \"b # c"#]
        );
    }

    #[test]
    fn hash_starts_a_comment() {
        assert_eq!(tokenize("vm info # trailing").unwrap(), vec!["vm", "info"]);
        assert!(tokenize("# whole line").unwrap().is_empty());
    }

    #[test]
    fn comment_char_inside_quotes_is_literal() {
        assert_eq!(tokenize("echo \"a # b\"").unwrap(), vec!["echo", "a # b"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(matches!(
            tokenize("echo \"oops"),
            Err(Error::UnterminatedQuote(_))
        ));
        assert!(matches!(
            tokenize("echo `oops"),
            Err(Error::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn quote_roundtrips_through_tokenize() {
        for token in ["plain", "has space", "has\"quote", "a\\b", "x#y", ""] {
            let quoted = quote(token);
            let toks = tokenize(&quoted).unwrap();
            assert_eq!(toks, vec![token.to_string()]);
        }
    }

    #[test]
    fn adjacent_quoted_and_bare_text_join() {
        assert_eq!(tokenize(r#"a"b c"d"#).unwrap(), vec!["ab cd"]);
    }
}
