// SPDX-License-Identifier: MIT

//! Buid set that spills to a temporary SQLite database
//!
//! Entries live in memory until the set grows past its threshold, after
//! which everything moves into a private on-disk database that SQLite
//! deletes when the connection closes.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use crate::core::error::Result;
use crate::core::node::Buid;

pub struct SpillSet {
    threshold: usize,
    mem: HashSet<Buid>,
    disk: Option<Connection>,
    len: usize,
}

impl SpillSet {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            mem: HashSet::new(),
            disk: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.disk.is_some()
    }

    /// Insert a buid, returning whether it was new
    pub fn add(&mut self, buid: &Buid) -> Result<bool> {
        if let Some(db) = &self.disk {
            let added = db.execute("INSERT OR IGNORE INTO buids (buid) VALUES (?1)", params![&buid.as_bytes()[..]])?;
            if added > 0 {
                self.len += 1;
            }
            return Ok(added > 0);
        }
        if !self.mem.insert(*buid) {
            return Ok(false);
        }
        self.len += 1;
        if self.mem.len() > self.threshold {
            self.spill()?;
        }
        Ok(true)
    }

    pub fn contains(&self, buid: &Buid) -> Result<bool> {
        match &self.disk {
            Some(db) => {
                let found = db
                    .query_row(
                        "SELECT 1 FROM buids WHERE buid = ?1",
                        params![&buid.as_bytes()[..]],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            }
            None => Ok(self.mem.contains(buid)),
        }
    }

    /// Remove a buid if present
    pub fn discard(&mut self, buid: &Buid) -> Result<()> {
        let removed = match &self.disk {
            Some(db) => db.execute("DELETE FROM buids WHERE buid = ?1", params![&buid.as_bytes()[..]])? > 0,
            None => self.mem.remove(buid),
        };
        if removed {
            self.len -= 1;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        log::debug!("Spilling set of {} buids to disk", self.mem.len());
        let mut db = Connection::open("")?;
        db.execute_batch("CREATE TABLE buids (buid BLOB PRIMARY KEY) WITHOUT ROWID;")?;
        {
            let txn = db.transaction()?;
            {
                let mut insert = txn.prepare("INSERT INTO buids (buid) VALUES (?1)")?;
                for buid in self.mem.drain() {
                    insert.execute(params![&buid.as_bytes()[..]])?;
                }
            }
            txn.commit()?;
        }
        self.disk = Some(db);
        Ok(())
    }
}
