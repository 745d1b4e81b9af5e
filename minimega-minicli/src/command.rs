//! A parsed command bound to its handler and arguments

use std::collections::HashMap;
use std::fmt;

use crate::token::quote;

/// Where a command is meant to run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// This node only
    #[default]
    Local,
    /// A named set of mesh members
    Hosts(Vec<String>),
    /// Every mesh member
    All,
}

#[derive(Debug, Clone, Default)]
pub struct Command {
    /// The raw input this command was parsed from
    pub original: String,
    /// Index of the matched handler in the registry
    pub(crate) handler: usize,
    /// The tokens the pattern bound, in input order
    pub tokens: Vec<String>,
    pub string_args: HashMap<String, String>,
    pub bool_args: HashMap<String, bool>,
    pub list_args: HashMap<String, Vec<String>>,
    /// Bound nested command for `(command)` suffix patterns
    pub subcommand: Option<Box<Command>>,
    pub scope: Scope,
}

impl Command {
    /// Canonical text: tokenizing it reproduces `self.tokens`, so
    /// parsing is idempotent
    pub fn canonical(&self) -> String {
        self.tokens
            .iter()
            .map(|t| quote(t))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
