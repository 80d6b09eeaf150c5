//! Verbose prompt/response trace (`trace.log`).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

/// One backend attempt, tagged with its commit and stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub commit: String,
    pub stage: String,
    /// 1-based attempt number within the stage, transient faults included.
    pub attempt: u32,
    pub prompt: String,
    /// `None` when the attempt produced no response.
    pub response: Option<String>,
    /// Why the attempt ended the way it did (`ok`, `ambiguous`, fault reason).
    pub note: String,
}

/// Order-preserving sink for [`TraceEntry`] records.
pub trait TraceSink {
    fn record(&mut self, entry: &TraceEntry) -> Result<()>;
}

/// Appends human-readable trace blocks to a file, flushing after each one.
pub struct FileTrace {
    out: BufWriter<File>,
}

impl FileTrace {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl TraceSink for FileTrace {
    fn record(&mut self, entry: &TraceEntry) -> Result<()> {
        self.out
            .write_all(format_entry(entry).as_bytes())
            .context("write trace entry")?;
        self.out.flush().context("flush trace")
    }
}

fn format_entry(entry: &TraceEntry) -> String {
    let mut block = format!(
        "=== {} {} attempt {} ({})\n--- prompt ---\n{}\n",
        entry.commit, entry.stage, entry.attempt, entry.note, entry.prompt
    );
    match &entry.response {
        Some(response) => {
            block.push_str("--- response ---\n");
            block.push_str(response);
            block.push('\n');
        }
        None => block.push_str("--- no response ---\n"),
    }
    block.push('\n');
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(attempt: u32, response: Option<&str>, note: &str) -> TraceEntry {
        TraceEntry {
            commit: "abc".to_string(),
            stage: "bug-01".to_string(),
            attempt,
            prompt: "Is this a fix?".to_string(),
            response: response.map(str::to_string),
            note: note.to_string(),
        }
    }

    #[test]
    fn appends_entries_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("trace.log");
        let mut trace = FileTrace::open(&path).expect("open");
        trace
            .record(&entry(1, None, "transient: connection refused"))
            .expect("first");
        trace.record(&entry(2, Some("BUGFIX"), "ok")).expect("second");

        let contents = std::fs::read_to_string(&path).expect("read");
        let first = contents.find("attempt 1 (transient").expect("first block");
        let second = contents.find("attempt 2 (ok)").expect("second block");
        assert!(first < second);
        assert!(contents.contains("--- no response ---"));
        assert!(contents.contains("--- response ---\nBUGFIX\n"));
    }

    #[test]
    fn reopening_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("trace.log");
        FileTrace::open(&path)
            .expect("open")
            .record(&entry(1, Some("NOT"), "fail"))
            .expect("record");
        FileTrace::open(&path)
            .expect("reopen")
            .record(&entry(1, Some("BUGFIX"), "ok"))
            .expect("record");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents.matches("=== abc bug-01").count(), 2);
    }
}
