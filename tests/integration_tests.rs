use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dnsprint::config::{ProbeConfig, TrainConfig};
use dnsprint::model::{self, ArtifactPaths, Corpus, Granularity};
use dnsprint::network::parse_targets;
use dnsprint::output::ScanRecord;
use dnsprint::pipeline::ScanPipeline;
use dnsprint::scanner::wire::{DnsClass, HeaderFlag, Opcode};
use dnsprint::scanner::{generate, ProbeExecutor, QueryAxes, Transport, TransportError};
use dnsprint::FingerprintError;

/// In-process stand-in for a lab of DNS servers, keyed by the last octet.
///
/// .1 and .2 behave identically, .3 and .4 each have their own quirks,
/// anything else never answers.
struct Zoo;

#[async_trait]
impl Transport for Zoo {
    async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let opcode = (query[2] >> 3) & 0x0f;
        let rd = query[2] & 0x01 != 0;
        let class = u16::from_be_bytes([query[query.len() - 2], query[query.len() - 1]]);
        let last_octet = match server.ip() {
            IpAddr::V4(ip) => ip.octets()[3],
            IpAddr::V6(_) => 0,
        };

        let (rcode, ancount) = match last_octet {
            1 | 2 => match (class, opcode) {
                (3, _) => (5, 0),
                (_, 0) => (0, 1),
                _ => (4, 0),
            },
            3 => match (class, opcode) {
                (3, _) => (0, 1),
                (_, 0) => (0, 1),
                _ => (5, 0),
            },
            4 => {
                if rd {
                    (1, 0)
                } else {
                    (2, 0)
                }
            }
            _ => {
                tokio::time::sleep(wait).await;
                return Err(TransportError::Timeout);
            }
        };

        let mut response = query[..2].to_vec();
        response.push(0x80 | (opcode << 3) | (query[2] & 0x01));
        response.push(rcode);
        response.extend_from_slice(&[0, 1, 0, ancount, 0, 0, 0, 0]);
        Ok(response)
    }
}

fn lab_axes() -> QueryAxes {
    QueryAxes {
        classes: vec![DnsClass::IN, DnsClass::CH],
        opcodes: vec![Opcode::Query, Opcode::Status],
        flags: vec![HeaderFlag::RD],
        ..QueryAxes::default()
    }
}

fn scan_config() -> ProbeConfig {
    ProbeConfig {
        port: 53,
        timeout: Duration::from_millis(20),
        workers: 6,
    }
}

/// Collect three rounds from the lab, train, and persist the artifacts.
async fn train_lab(artifacts: &std::path::Path) -> ArtifactPaths {
    let targets = parse_targets(
        "bind-9.18:latest,10.0.0.1\nbind-9.16:latest,10.0.0.2\nunbound-1.17:latest,10.0.0.3\nknot-3.2:latest,10.0.0.4\n",
        53,
    )
    .unwrap();
    let cases = generate(&lab_axes()).unwrap();
    let corpus_path = artifacts.join("signatures.jsonl");

    let executor = ProbeExecutor::new(Arc::new(Zoo), Duration::from_millis(20), 4);
    let mut corpus = Corpus::new();
    executor
        .run_rounds(&targets, &cases, 3, |entries| {
            corpus.absorb(entries);
            corpus.save(&corpus_path)
        })
        .await
        .unwrap();

    let entries = model::read_corpus(&corpus_path, Granularity::Build).unwrap();
    assert_eq!(entries.len(), 12);

    let config = TrainConfig {
        holdout_fraction: 0.0,
        seed: 1,
    };
    let outcome = model::train(entries, Some(Granularity::Build), &config).unwrap();
    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.groups[0].name, "bind-9.16|bind-9.18");

    let paths = ArtifactPaths::new(artifacts.join("models"), Some(Granularity::Build));
    paths.save_model(&outcome.model).unwrap();
    paths.save_important(&outcome.important).unwrap();
    paths.save_report(&outcome.report.to_string()).unwrap();
    paths.save_tree(&outcome.model.render_tree().unwrap()).unwrap();
    paths
}

fn parse_records(raw: &[u8]) -> Vec<ScanRecord> {
    String::from_utf8(raw.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_train_then_scan_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;

    let model = paths.load_model().unwrap();
    let important = paths.load_important().unwrap();
    assert!(!important.is_empty());
    assert!(important.len() <= generate(&lab_axes()).unwrap().len());

    let pipeline = ScanPipeline::new(model, &lab_axes(), &important, &scan_config())
        .unwrap()
        .with_chunk_size(2);

    let input = "10.0.0.1\nnot-an-ip\n10.0.0.3\n\n10.0.0.4\n10.0.0.2\n";
    let mut output = Vec::new();
    let summary = pipeline
        .run(input.as_bytes(), &mut output, |_| Arc::new(Zoo) as Arc<dyn Transport>)
        .await
        .unwrap();

    assert_eq!(summary.classified, 4);
    assert_eq!(summary.skipped, 1);

    let records = parse_records(&output);
    let ips: Vec<String> = records.iter().map(|record| record.ip.to_string()).collect();
    assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4", "10.0.0.2"]);
    assert_eq!(records[0].versions, vec!["bind-9.16", "bind-9.18"]);
    assert_eq!(records[1].versions, vec!["unbound-1.17"]);
    assert_eq!(records[2].versions, vec!["knot-3.2"]);
    assert_eq!(records[3].versions, records[0].versions);
}

#[tokio::test]
async fn test_silent_address_still_gets_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;
    let pipeline = ScanPipeline::new(
        paths.load_model().unwrap(),
        &lab_axes(),
        &paths.load_important().unwrap(),
        &scan_config(),
    )
    .unwrap();

    let mut output = Vec::new();
    let summary = pipeline
        .run("10.0.0.99\n10.0.0.3\n".as_bytes(), &mut output, |_| {
            Arc::new(Zoo) as Arc<dyn Transport>
        })
        .await
        .unwrap();

    assert_eq!(summary.classified, 2);
    let records = parse_records(&output);
    assert_eq!(records.len(), 2);
    assert!(!records[0].versions.is_empty());
    assert_eq!(records[1].versions, vec!["unbound-1.17"]);
}

#[tokio::test]
async fn test_axes_missing_an_important_case_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;
    let mut important = paths.load_important().unwrap();
    important.insert("baseline_A_HS_NOTIFY".to_string());

    let result = ScanPipeline::new(paths.load_model().unwrap(), &lab_axes(), &important, &scan_config());
    match result {
        Err(err @ FingerprintError::SchemaMismatch(_)) => {
            assert!(err.is_fatal());
            assert!(err.to_string().contains("baseline_A_HS_NOTIFY"));
        }
        Err(other) => panic!("expected schema mismatch, got {}", other),
        Ok(_) => panic!("expected schema mismatch"),
    }
}

#[tokio::test]
async fn test_tampered_model_is_refused_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;

    let raw = std::fs::read_to_string(paths.model()).unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["columns"].as_array_mut().unwrap().pop();
    std::fs::write(paths.model(), serde_json::to_string(&value).unwrap()).unwrap();

    assert!(matches!(paths.load_model(), Err(FingerprintError::SchemaMismatch(_))));
}

#[tokio::test]
async fn test_tree_dump_names_important_splits() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;
    assert_eq!(paths.tree(), dir.path().join("models").join("tree_build.txt"));

    let text = std::fs::read_to_string(paths.tree()).unwrap();
    let important = paths.load_important().unwrap();
    let root = text.lines().next().unwrap();
    assert!(root.starts_with("|--- "));
    assert!(important.iter().any(|name| root.contains(&format!("{}[", name))));
    assert!(text.contains("class: unbound-1.17"));
    assert!(text.contains("class: knot-3.2"));
}

#[test]
fn test_performance_report_is_written() {
    let report = model::PerformanceReport {
        accuracy: Some(1.0),
        train_rows: 12,
        test_rows: 0,
        features: 10,
        important_features: 3,
        test_cases: 8,
        important_test_cases: 2,
        versions: 4,
        individual_labels: 2,
    };
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::new(dir.path(), Some(Granularity::Vendor));
    paths.save_report(&report.to_string()).unwrap();

    let text = std::fs::read_to_string(dir.path().join("performance_vendor.txt")).unwrap();
    assert!(text.contains("Not important testcases: 6"));
    assert!(text.contains("Individual versions: 2"));
}

#[test]
fn test_default_matrix_size() {
    let cases = generate(&QueryAxes::default()).unwrap();
    assert_eq!(cases.len(), 768);
    let names: BTreeSet<&str> = cases.iter().map(|case| case.name.as_str()).collect();
    assert_eq!(names.len(), 768);
}

#[tokio::test]
async fn test_undecodable_line_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = train_lab(dir.path()).await;
    let pipeline = ScanPipeline::new(
        paths.load_model().unwrap(),
        &lab_axes(),
        &paths.load_important().unwrap(),
        &scan_config(),
    )
    .unwrap()
    .with_chunk_size(1);

    let input: &[u8] = b"10.0.0.3\n\xff\xfe1\n10.0.0.4\n";
    let mut output = Vec::new();
    let summary = pipeline
        .run(input, &mut output, |_| Arc::new(Zoo) as Arc<dyn Transport>)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.classified, 2);
    let records = parse_records(&output);
    let ips: Vec<String> = records.iter().map(|record| record.ip.to_string()).collect();
    assert_eq!(ips, vec!["10.0.0.3", "10.0.0.4"]);
    assert_eq!(records[1].versions, vec!["knot-3.2"]);
}
