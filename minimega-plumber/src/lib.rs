//! Named in-process pipes
//!
//! A pipe is created on first reference. Writers push string messages;
//! readers receive them according to the pipe's delivery mode. Closed
//! readers are pruned on the next write.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such pipe: {0}")]
    NoSuchPipe(String),

    #[error("unknown delivery mode: {0}")]
    BadMode(String),
}

/// How a write is spread across a pipe's readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every reader sees every message
    #[default]
    All,
    /// Each message goes to one reader, rotating
    RoundRobin,
    /// Each message goes to one reader, chosen at random
    Random,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Mode::All),
            "round-robin" => Ok(Mode::RoundRobin),
            "random" => Ok(Mode::Random),
            other => Err(Error::BadMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::All => "all",
            Mode::RoundRobin => "round-robin",
            Mode::Random => "random",
        };
        f.write_str(s)
    }
}

const READER_LEN: usize = 1024;

struct Pipe {
    mode: Mode,
    readers: Vec<mpsc::Sender<String>>,
    next: usize,
    last: Option<String>,
    writes: u64,
}

impl Pipe {
    fn new() -> Self {
        Pipe {
            mode: Mode::All,
            readers: Vec::new(),
            next: 0,
            last: None,
            writes: 0,
        }
    }
}

/// Snapshot of one pipe for status output
#[derive(Debug, Clone)]
pub struct PipeStatus {
    pub name: String,
    pub mode: Mode,
    pub readers: usize,
    pub writes: u64,
    pub last: Option<String>,
}

/// The pipe table. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct Plumber {
    pipes: Arc<Mutex<HashMap<String, Pipe>>>,
}

impl Plumber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a reader to a pipe, creating the pipe if needed
    pub fn reader(&self, name: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(READER_LEN);

        let mut pipes = self.pipes.lock().unwrap();
        pipes.entry(name.to_string()).or_insert_with(Pipe::new).readers.push(tx);

        rx
    }

    /// Write a message into a pipe, creating the pipe if needed.
    /// Delivery follows the pipe's mode; full or closed readers are
    /// skipped and closed ones pruned.
    pub fn write(&self, name: &str, message: impl Into<String>) {
        let message = message.into();

        let mut pipes = self.pipes.lock().unwrap();
        let pipe = pipes.entry(name.to_string()).or_insert_with(Pipe::new);

        pipe.readers.retain(|r| !r.is_closed());
        pipe.writes += 1;
        pipe.last = Some(message.clone());

        if pipe.readers.is_empty() {
            trace!(pipe = %name, "write with no readers");
            return;
        }

        match pipe.mode {
            Mode::All => {
                for reader in &pipe.readers {
                    let _ = reader.try_send(message.clone());
                }
            }
            Mode::RoundRobin => {
                pipe.next = (pipe.next + 1) % pipe.readers.len();
                let _ = pipe.readers[pipe.next].try_send(message);
            }
            Mode::Random => {
                let pick = rand::thread_rng().gen_range(0..pipe.readers.len());
                let _ = pipe.readers[pick].try_send(message);
            }
        }
    }

    /// Change a pipe's delivery mode
    pub fn set_mode(&self, name: &str, mode: Mode) {
        let mut pipes = self.pipes.lock().unwrap();
        pipes.entry(name.to_string()).or_insert_with(Pipe::new).mode = mode;
    }

    /// The most recent message written to a pipe
    pub fn last(&self, name: &str) -> Option<String> {
        self.pipes.lock().unwrap().get(name).and_then(|p| p.last.clone())
    }

    /// Drop a pipe; its readers observe channel close
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let mut pipes = self.pipes.lock().unwrap();
        pipes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchPipe(name.to_string()))
    }

    /// Snapshot of every pipe, sorted by name
    pub fn pipes(&self) -> Vec<PipeStatus> {
        let pipes = self.pipes.lock().unwrap();
        let mut out: Vec<PipeStatus> = pipes
            .iter()
            .map(|(name, pipe)| PipeStatus {
                name: name.clone(),
                mode: pipe.mode,
                readers: pipe.readers.iter().filter(|r| !r.is_closed()).count(),
                writes: pipe.writes,
                last: pipe.last.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_mode_reaches_every_reader() {
        let plumber = Plumber::new();

        let mut r1 = plumber.reader("events");
        let mut r2 = plumber.reader("events");

        plumber.write("events", "boot");

        assert_eq!(r1.recv().await.unwrap(), "boot");
        assert_eq!(r2.recv().await.unwrap(), "boot");
    }

    #[tokio::test]
    async fn round_robin_alternates() {
        let plumber = Plumber::new();
        plumber.set_mode("work", Mode::RoundRobin);

        let mut r1 = plumber.reader("work");
        let mut r2 = plumber.reader("work");

        plumber.write("work", "one");
        plumber.write("work", "two");

        // each reader got exactly one message
        let first = tokio::time::timeout(std::time::Duration::from_secs(1), r1.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(1), r2.recv())
            .await
            .unwrap()
            .unwrap();

        let mut got = vec![first, second];
        got.sort();
        assert_eq!(got, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn random_mode_delivers_to_exactly_one() {
        let plumber = Plumber::new();
        plumber.set_mode("lottery", Mode::Random);

        let mut readers: Vec<_> = (0..3).map(|_| plumber.reader("lottery")).collect();

        plumber.write("lottery", "winner");

        let mut delivered = 0;
        for r in readers.iter_mut() {
            if r.try_recv().is_ok() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[test]
    fn last_value_and_status_track_writes() {
        let plumber = Plumber::new();

        plumber.write("state", "a");
        plumber.write("state", "b");

        assert_eq!(plumber.last("state").as_deref(), Some("b"));

        let status = plumber.pipes();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "state");
        assert_eq!(status[0].writes, 2);
    }

    #[tokio::test]
    async fn closed_readers_are_pruned() {
        let plumber = Plumber::new();

        let r1 = plumber.reader("p");
        drop(r1);
        let mut r2 = plumber.reader("p");

        plumber.write("p", "still flows");
        assert_eq!(r2.recv().await.unwrap(), "still flows");

        let status = plumber.pipes();
        assert_eq!(status[0].readers, 1);
    }

    #[test]
    fn modes_parse_and_print() {
        assert_eq!("all".parse::<Mode>().unwrap(), Mode::All);
        assert_eq!("round-robin".parse::<Mode>().unwrap(), Mode::RoundRobin);
        assert_eq!("random".parse::<Mode>().unwrap(), Mode::Random);
        assert!("loud".parse::<Mode>().is_err());
        assert_eq!(Mode::RoundRobin.to_string(), "round-robin");
    }

    #[tokio::test]
    async fn deleted_pipes_close_their_readers() {
        let plumber = Plumber::new();

        let mut r = plumber.reader("gone");
        plumber.delete("gone").unwrap();

        assert!(r.recv().await.is_none());
        assert!(plumber.delete("gone").is_err());
    }
}
