// Newline-delimited signature corpus: one `{label: {round: {test case: signature}}}`
// object per line, rewritten after every collection round.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FingerprintError, Result};
use crate::scanner::{FingerprintEntry, Observations};

type CorpusRecord = BTreeMap<String, BTreeMap<String, Observations>>;

/// How finely software identities are distinguished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[value(name = "vendor", help = "Vendor only (bind, unbound, ...)")]
    Vendor,
    #[value(name = "major", help = "Vendor and major version")]
    Major,
    #[value(name = "minor", help = "Vendor, major and minor version")]
    Minor,
    #[value(name = "build", help = "Exact build")]
    Build,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Vendor => "vendor",
            Granularity::Major => "major",
            Granularity::Minor => "minor",
            Granularity::Build => "build",
        }
    }

    /// Map an image-style software name such as `bind-9.18.4:latest` onto this granularity.
    pub fn normalize(self, software: &str) -> String {
        let software = software.replace(":latest", "");
        match self {
            Granularity::Vendor => software.split('-').next().unwrap_or_default().to_string(),
            Granularity::Major => software.split('.').next().unwrap_or_default().to_string(),
            Granularity::Minor => {
                if software.matches('.').count() > 1 {
                    software.split('.').take(2).collect::<Vec<_>>().join(".")
                } else {
                    software
                }
            }
            Granularity::Build => software,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All rounds collected so far, keyed by label then round.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    records: BTreeMap<String, BTreeMap<String, Observations>>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, entries: Vec<FingerprintEntry>) {
        for entry in entries {
            self.records
                .entry(entry.label)
                .or_default()
                .entry(entry.round)
                .or_default()
                .extend(entry.observations);
        }
    }

    pub fn labels(&self) -> usize {
        self.records.len()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (label, rounds) in &self.records {
            let mut record = CorpusRecord::new();
            record.insert(label.clone(), rounds.clone());
            serde_json::to_writer(&mut *writer, &record)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Replace the file at `path` atomically, so an interrupted run keeps the last full round.
    pub fn save(&self, path: &Path) -> Result<()> {
        let staging = path.with_extension("partial");
        {
            let file = File::create(&staging).map_err(|e| FingerprintError::file(&staging, e))?;
            let mut writer = BufWriter::new(file);
            self.write_to(&mut writer)?;
            writer.flush()?;
        }
        fs::rename(&staging, path).map_err(|e| FingerprintError::file(path, e))?;
        debug!("saved {} labels to {}", self.records.len(), path.display());
        Ok(())
    }
}

/// Streams entries out of a corpus one line at a time.
pub struct CorpusReader<R: BufRead> {
    lines: Lines<R>,
    line_number: usize,
    granularity: Granularity,
    pending: VecDeque<FingerprintEntry>,
}

impl<R: BufRead> CorpusReader<R> {
    pub fn new(reader: R, granularity: Granularity) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            granularity,
            pending: VecDeque::new(),
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let record: CorpusRecord =
            serde_json::from_str(line).map_err(|e| FingerprintError::Corpus {
                line: self.line_number,
                reason: e.to_string(),
            })?;
        for (software, rounds) in record {
            let label = self.granularity.normalize(&software);
            for (round, observations) in rounds {
                self.pending
                    .push_back(FingerprintEntry::new(label.clone(), round, observations));
            }
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for CorpusReader<R> {
    type Item = Result<FingerprintEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.parse_line(&line) {
                return Some(Err(e));
            }
        }
    }
}

pub fn read_corpus(path: &Path, granularity: Granularity) -> Result<Vec<FingerprintEntry>> {
    let file = File::open(path).map_err(|e| FingerprintError::file(path, e))?;
    CorpusReader::new(BufReader::new(file), granularity).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Signature;

    #[test]
    fn test_granularity_normalization() {
        let name = "bind-9.18.4:latest";
        assert_eq!(Granularity::Vendor.normalize(name), "bind");
        assert_eq!(Granularity::Major.normalize(name), "bind-9");
        assert_eq!(Granularity::Minor.normalize(name), "bind-9.18");
        assert_eq!(Granularity::Build.normalize(name), "bind-9.18.4");
        assert_eq!(Granularity::Minor.normalize("knot-3.2:latest"), "knot-3.2");
        assert_eq!(Granularity::Major.normalize("windows-server:2019"), "windows-server:2019");
    }

    #[test]
    fn test_reader_expands_rounds_and_relabels() {
        let corpus = concat!(
            r#"{"bind-9.18.4:latest": {"round_1": {"t1": {"error": "timeout"}}, "round_2": {"t1": {"QR": 1}}}}"#,
            "\n\n",
            r#"{"bind-9.16.1:latest": {"round_1": {"t1": {"QR": 1, "RCODE": "REFUSED"}}}}"#,
            "\n"
        );
        let entries: Vec<FingerprintEntry> = CorpusReader::new(corpus.as_bytes(), Granularity::Vendor)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.label == "bind"));
        assert_eq!(entries[0].round, "round_1");
        assert_eq!(entries[0].observations["t1"], Signature::timeout());
    }

    #[test]
    fn test_reader_reports_line_number() {
        let corpus = "{\"a\": {}}\nnot json\n";
        let result: Result<Vec<FingerprintEntry>> =
            CorpusReader::new(corpus.as_bytes(), Granularity::Build).collect();
        match result {
            Err(FingerprintError::Corpus { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corpus error, got {:?}", other.map(|e| e.len())),
        }
    }

    #[test]
    fn test_saved_corpus_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.jsonl");

        let mut observations = Observations::new();
        observations.insert("t1".to_string(), Signature::timeout());
        let mut corpus = Corpus::new();
        corpus.absorb(vec![
            FingerprintEntry::new("unbound-1.17.0", "round_1", observations.clone()),
            FingerprintEntry::new("unbound-1.17.0", "round_2", observations.clone()),
            FingerprintEntry::new("nsd-4.6.1", "round_1", observations),
        ]);
        corpus.save(&path).unwrap();
        assert!(!path.with_extension("partial").exists());

        let entries = read_corpus(&path, Granularity::Build).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].label, "nsd-4.6.1");
        assert_eq!(corpus.labels(), 2);
    }
}
