// Streaming scan: addresses in, one classified JSON record per address out,
// a bounded chunk of input at a time.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::error::{FingerprintError, Result};
use crate::model::{split_label, Model};
use crate::network::parse_address;
use crate::output::{RecordWriter, ScanRecord};
use crate::scanner::{generate_filtered, round_id, ProbeExecutor, ProbeTarget, QueryAxes, TestCase, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub classified: usize,
    pub skipped: usize,
    pub chunks: usize,
}

pub struct ScanPipeline {
    model: Model,
    cases: Vec<TestCase>,
    config: ProbeConfig,
    chunk_size: usize,
}

impl ScanPipeline {
    /// Fails before any probing if the model and the configured axes disagree.
    pub fn new(model: Model, axes: &QueryAxes, important: &BTreeSet<String>, config: &ProbeConfig) -> Result<Self> {
        model.validate()?;
        if important.is_empty() {
            return Err(FingerprintError::SchemaMismatch(
                "model has no important test cases to probe".to_string(),
            ));
        }
        let allowed: HashSet<String> = important.iter().cloned().collect();
        let cases = generate_filtered(axes, &allowed)?;
        if cases.len() != allowed.len() {
            let generated: HashSet<&str> = cases.iter().map(|case| case.name.as_str()).collect();
            let missing: Vec<&str> = important
                .iter()
                .map(String::as_str)
                .filter(|name| !generated.contains(name))
                .collect();
            return Err(FingerprintError::SchemaMismatch(format!(
                "{} important test cases are not generated by the query axes: {}",
                missing.len(),
                missing.join(", ")
            )));
        }

        Ok(Self {
            model,
            cases,
            chunk_size: (config.workers / 3).max(1),
            config: config.clone(),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Read addresses from `input` until EOF, appending one record per valid
    /// address to `output` as soon as its chunk is classified.
    ///
    /// `make_transport` is called once per chunk with the chunk's worker
    /// budget; the transport is dropped when the chunk drains.
    pub async fn run<R, W, F>(&self, mut input: R, output: W, make_transport: F) -> Result<ScanSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Fn(usize) -> Arc<dyn Transport>,
    {
        let mut writer = RecordWriter::new(output);
        let mut summary = ScanSummary::default();
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut raw = Vec::new();
        let mut line_number = 0usize;

        loop {
            raw.clear();
            let exhausted = input.read_until(b'\n', &mut raw).await? == 0;
            if !exhausted {
                line_number += 1;
                match std::str::from_utf8(&raw) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => chunk.push(line.trim().to_string()),
                    Err(e) => {
                        warn!("skipping scan input line {}: not UTF-8 ({})", line_number, e);
                        summary.skipped += 1;
                        continue;
                    }
                }
            }
            if chunk.len() >= self.chunk_size || (exhausted && !chunk.is_empty()) {
                self.process_chunk(&chunk, &mut writer, &make_transport, &mut summary)
                    .await?;
                chunk.clear();
            }
            if exhausted {
                break;
            }
        }

        writer.flush().await?;
        Ok(summary)
    }

    async fn process_chunk<W, F>(
        &self,
        lines: &[String],
        writer: &mut RecordWriter<W>,
        make_transport: &F,
        summary: &mut ScanSummary,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        F: Fn(usize) -> Arc<dyn Transport>,
    {
        let mut targets = Vec::with_capacity(lines.len());
        for line in lines {
            match parse_address(line) {
                Ok(ip) => targets.push(ProbeTarget::new(
                    ip.to_string(),
                    SocketAddr::new(ip, self.config.port),
                )),
                Err(e) => {
                    warn!("skipping scan input line {:?}: {}", line, e);
                    summary.skipped += 1;
                }
            }
        }
        summary.chunks += 1;
        if targets.is_empty() {
            return Ok(());
        }

        let workers = self
            .config
            .workers
            .min(targets.len() * self.cases.len())
            .max(1);
        let executor = ProbeExecutor::new(make_transport(workers), self.config.timeout, workers);
        let entries = executor
            .sweep(&targets, &self.cases)
            .await
            .into_entries(&targets, &round_id(1));
        let predictions = self.model.predict(&entries)?;

        for (target, label) in targets.iter().zip(&predictions) {
            writer
                .write(&ScanRecord {
                    ip: target.address.ip(),
                    versions: split_label(label),
                })
                .await?;
        }
        writer.flush().await?;
        summary.classified += predictions.len();
        info!(
            "chunk {} classified: {} addresses with {} workers",
            summary.chunks,
            predictions.len(),
            workers
        );
        Ok(())
    }
}
