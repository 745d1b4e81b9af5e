//! Command multiplexer for the minimega control plane
//!
//! Handlers register patterns against a [`Registry`]. Input text is
//! tokenized, bound against the compiled patterns, and dispatched to
//! the matching handler on its own task; the handler streams response
//! bundles back over a channel. Patterns are compiled and checked for
//! collisions at registration, so an ambiguous grammar is a startup
//! error rather than a parse-time surprise.

pub mod command;
pub mod pattern;
pub mod response;
pub mod token;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub use command::{Command, Scope};
pub use pattern::Pattern;
pub use response::{render_csv, render_json, render_text, sort_bundle, Bundle, Response};
pub use token::tokenize;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unterminated quote in input: {0}")]
    UnterminatedQuote(String),

    #[error("invalid pattern: {0}")]
    BadPattern(String),

    #[error("pattern collides with an existing registration: {0}")]
    DuplicatePattern(String),

    #[error("no command matches: {0}")]
    NoMatch(String),
}

/// How many bundles a handler may buffer before it blocks
const STREAM_LEN: usize = 16;

/// The sending half a handler writes its bundles to
pub type BundleSender = mpsc::Sender<Bundle>;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HandlerFn = Arc<dyn Fn(Command, BundleSender) -> HandlerFuture + Send + Sync>;

pub struct Handler {
    pub patterns: Vec<String>,
    pub help_short: String,
    pub help_long: String,
    call: HandlerFn,
}

impl Handler {
    /// Build a handler from pattern strings and an async closure
    pub fn new<F, Fut>(patterns: &[&str], help_short: &str, call: F) -> Self
    where
        F: Fn(Command, BundleSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            help_short: help_short.to_string(),
            help_long: String::new(),
            call: Arc::new(move |cmd, tx| Box::pin(call(cmd, tx))),
        }
    }

    pub fn with_help_long(mut self, help_long: &str) -> Self {
        self.help_long = help_long.to_string();
        self
    }
}

struct Registered {
    handler: Handler,
    compiled: Vec<Pattern>,
}

/// The compiled command table. Registration happens once at startup;
/// afterwards the registry is shared read-only across dispatch tasks.
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Registered>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and install a handler's patterns. Colliding or malformed
    /// patterns fail here, at startup.
    pub fn register(&mut self, handler: Handler) -> Result<(), Error> {
        let mut compiled = Vec::with_capacity(handler.patterns.len());

        for text in &handler.patterns {
            let pattern = Pattern::compile(text)?;

            let signature = pattern.signature();
            let collision = self
                .handlers
                .iter()
                .flat_map(|r| &r.compiled)
                .chain(compiled.iter())
                .any(|existing| existing.signature() == signature);

            if collision {
                return Err(Error::DuplicatePattern(text.clone()));
            }

            compiled.push(pattern);
        }

        self.handlers.push(Registered { handler, compiled });
        Ok(())
    }

    /// Parse input into a bound command. Blank lines and comments yield
    /// `None`.
    pub fn compile(&self, input: &str) -> Result<Option<Command>, Error> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(None);
        }

        self.compile_tokens(&tokens, input).map(Some)
    }

    fn compile_tokens(&self, tokens: &[String], original: &str) -> Result<Command, Error> {
        // all candidates that bind, ranked by how many literals matched;
        // registration order breaks ties
        let mut best: Option<(usize, usize, pattern::Bindings)> = None;

        for (h, registered) in self.handlers.iter().enumerate() {
            for pattern in &registered.compiled {
                if let Some(bound) = pattern.bind(tokens) {
                    let better = match &best {
                        Some((_, literals, _)) => bound.literals > *literals,
                        None => true,
                    };
                    if better {
                        best = Some((h, bound.literals, bound));
                    }
                }
            }
        }

        let Some((handler, _, bound)) = best else {
            return Err(Error::NoMatch(original.to_string()));
        };

        let subcommand = if bound.subcommand_tokens.is_empty() {
            None
        } else {
            let inner = self.compile_tokens(
                &bound.subcommand_tokens,
                &bound.subcommand_tokens.join(" "),
            )?;
            Some(Box::new(inner))
        };

        Ok(Command {
            original: original.to_string(),
            handler,
            tokens: tokens.to_vec(),
            string_args: bound.string_args,
            bool_args: bound.bool_args,
            list_args: bound.list_args,
            subcommand,
            scope: Scope::Local,
        })
    }

    /// Dispatch a bound command on its own task; the returned channel
    /// yields the handler's bundles and closes when it finishes
    pub fn exec(&self, cmd: Command) -> mpsc::Receiver<Bundle> {
        let (tx, rx) = mpsc::channel(STREAM_LEN);

        let call = self.handlers[cmd.handler].handler.call.clone();
        debug!(command = %cmd.original, "dispatching");

        tokio::spawn(async move {
            call(cmd, tx).await;
        });

        rx
    }

    /// Convenience: compile then dispatch. `Ok(None)` means the input
    /// was blank or a comment.
    pub fn exec_string(&self, input: &str) -> Result<Option<mpsc::Receiver<Bundle>>, Error> {
        match self.compile(input)? {
            Some(cmd) => Ok(Some(self.exec(cmd))),
            None => Ok(None),
        }
    }

    /// Short help for every registered pattern
    pub fn help(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .handlers
            .iter()
            .flat_map(|r| {
                r.handler
                    .patterns
                    .iter()
                    .map(|p| (p.clone(), r.handler.help_short.clone()))
            })
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> Registry {
        let mut registry = Registry::new();

        registry
            .register(Handler::new(
                &["echo <text>..."],
                "repeat the arguments",
                |cmd, tx| async move {
                    let text = cmd.list_args["text"].join(" ");
                    let _ = tx.send(vec![Response::text("local", text)]).await;
                },
            ))
            .unwrap();

        registry
            .register(Handler::new(
                &["mesh send <recipients> (command)"],
                "run a command on mesh members",
                |_cmd, _tx| async move {},
            ))
            .unwrap();

        registry
    }

    #[tokio::test]
    async fn exec_streams_bundles() {
        let registry = echo_registry();

        let cmd = registry.compile("echo hello world").unwrap().unwrap();
        let mut rx = registry.exec(cmd);

        let bundle = rx.recv().await.unwrap();
        assert_eq!(bundle[0].response, "hello world");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn blank_and_comment_input_yield_none() {
        let registry = echo_registry();

        assert!(registry.compile("").unwrap().is_none());
        assert!(registry.compile("   # nothing").unwrap().is_none());
    }

    #[test]
    fn unmatched_input_is_a_parse_error() {
        let registry = echo_registry();
        assert!(matches!(
            registry.compile("frobnicate"),
            Err(Error::NoMatch(_))
        ));
    }

    #[test]
    fn duplicate_patterns_fail_registration() {
        let mut registry = echo_registry();

        let err = registry
            .register(Handler::new(&["echo <words>..."], "dup", |_c, _t| async {}))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePattern(_)));
    }

    #[test]
    fn nested_commands_parse_recursively() {
        let registry = echo_registry();

        let cmd = registry
            .compile("mesh send kn[1-2] echo hi there")
            .unwrap()
            .unwrap();

        assert_eq!(cmd.string_args["recipients"], "kn[1-2]");

        let sub = cmd.subcommand.as_ref().unwrap();
        assert_eq!(sub.list_args["text"], vec!["hi", "there"]);
    }

    #[test]
    fn parsing_is_idempotent() {
        let registry = echo_registry();

        for input in [
            "echo hello world",
            "echo \"hello world\"",
            "mesh send all echo a b",
        ] {
            let first = registry.compile(input).unwrap().unwrap();
            let second = registry.compile(&first.canonical()).unwrap().unwrap();

            assert_eq!(first.tokens, second.tokens);
            assert_eq!(first.handler, second.handler);
            assert_eq!(first.canonical(), second.canonical());
        }
    }

    #[test]
    fn longest_specific_match_wins() {
        let mut registry = Registry::new();

        registry
            .register(Handler::new(&["vm <action>"], "generic", |_c, _t| async {}))
            .unwrap();
        registry
            .register(Handler::new(&["vm info"], "specific", |_c, _t| async {}))
            .unwrap();

        let cmd = registry.compile("vm info").unwrap().unwrap();
        // the two-literal pattern beats literal-plus-string
        assert_eq!(cmd.handler, 1);

        let cmd = registry.compile("vm start").unwrap().unwrap();
        assert_eq!(cmd.handler, 0);
    }
}
