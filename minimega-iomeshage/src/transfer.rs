//! In-flight transfer bookkeeping

use std::path::PathBuf;

/// State of one file being fetched
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Canonical name, relative to the file base
    pub name: String,
    /// Scratch directory holding `<file>.part_<N>` pieces
    pub dir: PathBuf,
    /// Total part count
    pub parts: u64,
    /// Which parts have been written to the scratch directory
    pub received: Vec<bool>,
    /// The part currently being fetched, or -1 while queued
    pub inflight: i64,
    /// Waiting on the transfer queue
    pub queued: bool,
    /// Permission bits to apply on completion
    pub perm: u32,
}

impl Transfer {
    pub fn new(name: String, dir: PathBuf, parts: u64, perm: u32) -> Self {
        Transfer {
            name,
            dir,
            parts,
            received: vec![false; parts as usize],
            inflight: -1,
            queued: true,
            perm,
        }
    }

    pub fn complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    pub fn received_count(&self) -> u64 {
        self.received.iter().filter(|r| **r).count() as u64
    }

    /// Path of one part file inside the scratch directory
    pub fn part_path(&self, part: u64) -> PathBuf {
        let file = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or(self.name.as_str());
        self.dir.join(format!("{file}.part_{part}"))
    }
}

/// Snapshot of a transfer for status output
#[derive(Debug, Clone)]
pub struct TransferStatus {
    pub name: String,
    pub parts: u64,
    pub received: u64,
    pub queued: bool,
}

impl From<&Transfer> for TransferStatus {
    fn from(t: &Transfer) -> Self {
        TransferStatus {
            name: t.name.clone(),
            parts: t.parts,
            received: t.received_count(),
            queued: t.queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_completion() {
        let mut t = Transfer::new("blob".into(), PathBuf::from("/tmp/x"), 3, 0o644);

        assert!(!t.complete());
        assert_eq!(t.received_count(), 0);

        t.received[0] = true;
        t.received[2] = true;
        assert!(!t.complete());
        assert_eq!(t.received_count(), 2);

        t.received[1] = true;
        assert!(t.complete());
    }

    #[test]
    fn part_paths_use_the_file_basename() {
        let t = Transfer::new("images/vmlinuz".into(), PathBuf::from("/base/transfer_x"), 2, 0);
        assert_eq!(
            t.part_path(1),
            PathBuf::from("/base/transfer_x/vmlinuz.part_1")
        );
    }
}
