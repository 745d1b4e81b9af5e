//! Command patterns and token binding
//!
//! A pattern is a sequence of items: literals, named strings `<name>`,
//! choices `<a,b,c>`, lists `<name>...`, optional forms in `[...]`, and
//! a trailing `(command)` that captures a nested command. Patterns are
//! compiled once at registration, so malformed or colliding patterns
//! fail at startup rather than at parse time.

use std::collections::HashMap;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    /// A word that must appear verbatim
    Literal(String),
    /// A named free-form string
    Str(String),
    /// One token drawn from a fixed option set
    Choice(Vec<String>),
    /// A named list consuming the remaining tokens
    List(String),
    /// A nested command consuming the remaining tokens
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternItem {
    pub kind: ItemKind,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub text: String,
    pub items: Vec<PatternItem>,
}

/// Bindings produced by a successful match
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    pub string_args: HashMap<String, String>,
    pub bool_args: HashMap<String, bool>,
    pub list_args: HashMap<String, Vec<String>>,
    pub subcommand_tokens: Vec<String>,
    /// How many literal items matched; used to rank competing patterns
    pub literals: usize,
}

impl Pattern {
    /// Compile a pattern string into items
    pub fn compile(text: &str) -> Result<Self, Error> {
        let mut items = Vec::new();
        let mut seen_tail = false;

        for word in text.split_whitespace() {
            if seen_tail {
                return Err(Error::BadPattern(format!(
                    "{text}: nothing may follow a list or nested command"
                )));
            }

            let item = Self::compile_item(word, text)?;

            if matches!(item.kind, ItemKind::List(_) | ItemKind::Command) {
                seen_tail = true;
            }

            items.push(item);
        }

        if items.is_empty() {
            return Err(Error::BadPattern(text.to_string()));
        }

        Ok(Pattern {
            text: text.to_string(),
            items,
        })
    }

    fn compile_item(word: &str, pattern: &str) -> Result<PatternItem, Error> {
        let bad = || Error::BadPattern(pattern.to_string());

        // optional forms: [name], [a,b,c], [name]...
        if let Some(rest) = word.strip_prefix('[') {
            let (name, is_list) = match rest.strip_suffix("]...") {
                Some(name) => (name, true),
                None => (rest.strip_suffix(']').ok_or_else(bad)?, false),
            };
            if name.is_empty() {
                return Err(bad());
            }

            let kind = if is_list {
                ItemKind::List(name.to_string())
            } else if name.contains(',') {
                ItemKind::Choice(name.split(',').map(str::to_string).collect())
            } else {
                ItemKind::Str(name.to_string())
            };

            return Ok(PatternItem {
                kind,
                optional: true,
            });
        }

        // required forms: (command), <name>, <a,b,c>, <name>..., literal
        let kind = if word == "(command)" {
            ItemKind::Command
        } else if let Some(rest) = word.strip_prefix('<') {
            let (name, is_list) = match rest.strip_suffix(">...") {
                Some(name) => (name, true),
                None => (rest.strip_suffix('>').ok_or_else(bad)?, false),
            };
            if name.is_empty() {
                return Err(bad());
            }

            if is_list {
                ItemKind::List(name.to_string())
            } else if name.contains(',') {
                ItemKind::Choice(name.split(',').map(str::to_string).collect())
            } else {
                ItemKind::Str(name.to_string())
            }
        } else {
            ItemKind::Literal(word.to_string())
        };

        Ok(PatternItem {
            kind,
            optional: false,
        })
    }

    /// Attempt to bind tokens against this pattern, greedy-left
    pub fn bind(&self, tokens: &[String]) -> Option<Bindings> {
        let mut bound = Bindings::default();
        let mut pos = 0usize;

        for (i, item) in self.items.iter().enumerate() {
            let left = tokens.len() - pos;
            let needed_after = min_needed(&self.items[i + 1..]);

            match &item.kind {
                ItemKind::Literal(word) => {
                    if pos < tokens.len() && &tokens[pos] == word {
                        bound.literals += 1;
                        pos += 1;
                    } else if !item.optional {
                        return None;
                    }
                }
                ItemKind::Str(name) => {
                    let take = pos < tokens.len() && (!item.optional || left > needed_after);
                    if take {
                        bound.string_args.insert(name.clone(), tokens[pos].clone());
                        pos += 1;
                    } else if !item.optional {
                        return None;
                    }
                }
                ItemKind::Choice(options) => {
                    let matched = pos < tokens.len() && options.contains(&tokens[pos]);
                    if matched {
                        bound.bool_args.insert(tokens[pos].clone(), true);
                        pos += 1;
                    } else if !item.optional {
                        return None;
                    }
                }
                ItemKind::List(name) => {
                    let rest: Vec<String> = tokens[pos..].to_vec();
                    if rest.is_empty() && !item.optional {
                        return None;
                    }
                    pos = tokens.len();
                    bound.list_args.insert(name.clone(), rest);
                }
                ItemKind::Command => {
                    let rest: Vec<String> = tokens[pos..].to_vec();
                    if rest.is_empty() && !item.optional {
                        return None;
                    }
                    pos = tokens.len();
                    bound.subcommand_tokens = rest;
                }
            }
        }

        if pos != tokens.len() {
            return None;
        }

        Some(bound)
    }

    /// Signature used to detect colliding registrations: two patterns
    /// with the same signature would bind the same inputs
    pub fn signature(&self) -> String {
        self.items
            .iter()
            .map(|item| {
                let body = match &item.kind {
                    ItemKind::Literal(word) => format!("={word}"),
                    ItemKind::Str(_) => "s".to_string(),
                    ItemKind::Choice(options) => format!("c:{}", options.join(",")),
                    ItemKind::List(_) => "l".to_string(),
                    ItemKind::Command => "n".to_string(),
                };
                if item.optional {
                    format!("?{body}")
                } else {
                    body
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Fewest tokens the remaining items can accept
fn min_needed(items: &[PatternItem]) -> usize {
    items.iter().filter(|item| !item.optional).count()
}
