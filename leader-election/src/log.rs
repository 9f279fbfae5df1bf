//! The Raft replicated log.
//!
//! Indices are 1-based. Index 0 is the empty prefix every log shares and has
//! term 0, so the consistency check for the first entry always passes.

use crate::types::{LogEntry, LogIndex, Term};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`. `Some(0)` for index 0, `None` past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// AppendEntries consistency check: does this log hold `prev_term` at `prev_index`?
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Leader side: appends a new entry and returns its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries
            .iter()
            .skip(start)
            .take(max)
            .cloned()
            .collect()
    }

    /// Follower side: merges `entries` that follow `prev_index`, which must
    /// already have passed [`RaftLog::matches`].
    ///
    /// Entries already present with the same term are kept as they are. The
    /// log is truncated only at the first conflicting entry, so a duplicate or
    /// reordered request never removes anything. Returns the index of the last
    /// entry the request covered.
    pub fn append_from(&mut self, prev_index: LogIndex, entries: Vec<LogEntry>) -> LogIndex {
        let mut index = prev_index;
        for entry in entries {
            index += 1;
            match self.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.entries.truncate(index as usize - 1);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
        }
        index
    }

    /// Vote restriction: is a candidate whose log ends at
    /// (`last_index`, `last_term`) at least as up to date as this one?
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let own_term = self.last_term();
        last_term > own_term || (last_term == own_term && last_index >= self.last_index())
    }
}
