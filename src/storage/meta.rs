//! Durable node metadata: current term, vote record, root credential
//!
//! Small append-history files. Writes flush to the OS before returning;
//! reads scan the history and keep the last intact record, so a torn
//! trailing write is treated as absent.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;

const TERM_FILE: &str = "term.data";
const VOTE_FILE: &str = "vote.data";
const ROOT_FILE: &str = "root.data";

/// Durable meta store. File handles live as long as the node.
pub struct Meta {
    dir: PathBuf,
    term_file: File,
    vote_file: File,
}

impl Meta {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Meta> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let term_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TERM_FILE))?;
        let vote_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(VOTE_FILE))?;
        Ok(Meta {
            dir,
            term_file,
            vote_file,
        })
    }

    /// Last intact term in the history, `0` on a fresh node.
    pub fn read_current_term(&self) -> io::Result<i64> {
        let mut term = 0;
        for line in self.read_lines(TERM_FILE)? {
            if let Ok(t) = line.trim().parse::<i64>() {
                term = t;
            }
        }
        info!(term, "read current term");
        Ok(term)
    }

    /// Append the new current term and flush.
    pub fn write_current_term(&mut self, term: i64) -> io::Result<()> {
        writeln!(self.term_file, "{term}")?;
        self.term_file.sync_data()
    }

    /// Last intact `(term, candidate)` vote record, if any.
    pub fn read_vote(&self) -> io::Result<Option<(i64, String)>> {
        let mut vote = None;
        for line in self.read_lines(VOTE_FILE)? {
            let mut parts = line.trim().splitn(2, ' ');
            if let (Some(term), Some(candidate)) = (parts.next(), parts.next()) {
                if let Ok(term) = term.parse::<i64>() {
                    if !candidate.is_empty() {
                        vote = Some((term, candidate.to_string()));
                    }
                }
            }
        }
        if let Some((term, ref candidate)) = vote {
            info!(term, candidate = %candidate, "read vote record");
        }
        Ok(vote)
    }

    /// Append a vote record and flush. The caller guarantees at most one
    /// record per term.
    pub fn write_vote(&mut self, term: i64, candidate: &str) -> io::Result<()> {
        writeln!(self.vote_file, "{term} {candidate}")?;
        self.vote_file.sync_data()
    }

    /// Root credential `(username, password)` if one was written.
    pub fn read_root_credential(&self) -> io::Result<Option<(String, String)>> {
        let path = self.dir.join(ROOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let line = match content.lines().next() {
            Some(line) => line,
            None => return Ok(None),
        };
        match line.split_once('\t') {
            Some((user, pass)) if !user.is_empty() => {
                Ok(Some((user.to_string(), pass.to_string())))
            }
            _ => Ok(None),
        }
    }

    /// Rewrite the root credential and flush.
    pub fn write_root_credential(&mut self, username: &str, password: &str) -> io::Result<()> {
        let mut file = File::create(self.dir.join(ROOT_FILE))?;
        writeln!(file, "{username}\t{password}")?;
        file.sync_data()
    }

    fn read_lines(&self, name: &str) -> io::Result<Vec<String>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(path)?
            .lines()
            .map(str::to_string)
            .collect())
    }
}
