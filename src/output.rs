use std::net::IpAddr;
use std::path::Path;

use colored::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::model::{ArtifactPaths, MergedLabelGroup, PerformanceReport};
use crate::pipeline::ScanSummary;

/// One line of scan output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub ip: IpAddr,
    /// Several entries when the prediction was a merged label.
    pub versions: Vec<String>,
}

/// Appends scan records as JSON lines.
pub struct RecordWriter<W> {
    inner: W,
    written: usize,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub async fn write(&mut self, record: &ScanRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub fn format_collection_summary(rounds: usize, labels: usize, cases: usize, corpus: &Path) -> String {
    format!(
        "\n{} {} {} {} {} {}\n{} {}\n",
        "▶".truecolor(0, 255, 65).bold(),
        format!("{} rounds", rounds).truecolor(255, 255, 255).bold(),
        "•".truecolor(64, 64, 64),
        format!("{} labels", labels).truecolor(0, 212, 255).bold(),
        "•".truecolor(64, 64, 64),
        format!("{} test cases", cases).truecolor(191, 64, 191).bold(),
        "corpus:".truecolor(128, 128, 128),
        corpus.display().to_string().truecolor(255, 255, 255)
    )
}

pub fn format_training_summary(
    report: &PerformanceReport,
    groups: &[MergedLabelGroup],
    paths: &ArtifactPaths,
) -> String {
    let mut output = String::new();
    let accuracy = match report.accuracy {
        Some(accuracy) => format!("{:.1}% accuracy", accuracy * 100.0),
        None => "no held-out rows".to_string(),
    };
    output.push_str(&format!(
        "\n{} {} {} {}\n",
        "▶".truecolor(0, 255, 65).bold(),
        accuracy.truecolor(0, 212, 255).bold(),
        "•".truecolor(64, 64, 64),
        format!(
            "{}/{} test cases kept",
            report.important_test_cases, report.test_cases
        )
        .truecolor(191, 64, 191)
        .bold()
    ));
    for group in groups {
        output.push_str(&format!(
            "  {} {}\n",
            "merged".truecolor(255, 140, 0),
            group.name.truecolor(128, 128, 128)
        ));
    }
    output.push_str(&format!(
        "{} {}\n",
        "model:".truecolor(128, 128, 128),
        paths.model().display().to_string().truecolor(255, 255, 255)
    ));
    output
}

pub fn format_scan_summary(summary: &ScanSummary) -> String {
    let skipped = if summary.skipped > 0 {
        format!("{} skipped", summary.skipped).truecolor(255, 140, 0)
    } else {
        "0 skipped".truecolor(128, 128, 128)
    };
    format!(
        "\n{} {} {} {} {} {}\n",
        "⚡".truecolor(0, 255, 65).bold(),
        format!("{} addresses classified", summary.classified).truecolor(255, 255, 255).bold(),
        "•".truecolor(64, 64, 64),
        skipped,
        "•".truecolor(64, 64, 64),
        format!("{} chunks", summary.chunks).truecolor(0, 212, 255)
    )
}
