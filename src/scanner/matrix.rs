use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::wire::{DnsClass, HeaderFlag, Opcode, RecordType};
use crate::error::{FingerprintError, Result};

/// The option axes a test matrix is generated from.
///
/// Every axis is an ordered list of legal values. Each entry of `flags`
/// contributes its own two-valued axis: the flag itself, then "absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryAxes {
    pub domains: Vec<String>,
    pub record_types: Vec<RecordType>,
    pub classes: Vec<DnsClass>,
    pub opcodes: Vec<Opcode>,
    pub flags: Vec<HeaderFlag>,
    /// Environment-specific suffix stripped from test case names.
    pub domain_suffix: Option<String>,
    /// Prefix every query name with a fresh random label.
    pub randomize_subdomain: bool,
}

impl Default for QueryAxes {
    fn default() -> Self {
        QueryAxes {
            domains: vec!["baseline.dnssoftver.com".to_string()],
            record_types: vec![RecordType::A],
            classes: vec![
                DnsClass::Reserved0,
                DnsClass::IN,
                DnsClass::CH,
                DnsClass::HS,
                DnsClass::NONE,
                DnsClass::ANY,
            ],
            opcodes: vec![Opcode::Query, Opcode::IQuery, Opcode::Status, Opcode::Notify],
            flags: vec![
                HeaderFlag::QR,
                HeaderFlag::AA,
                HeaderFlag::TC,
                HeaderFlag::RD,
                HeaderFlag::RA,
            ],
            domain_suffix: Some(".dnssoftver.com".to_string()),
            randomize_subdomain: true,
        }
    }
}

impl QueryAxes {
    /// Size of the cartesian product, or `None` if it does not fit in a `usize`.
    pub fn combinations(&self) -> Option<usize> {
        let flag_states = u32::try_from(self.flags.len())
            .ok()
            .and_then(|count| 1usize.checked_shl(count))?;
        [
            self.domains.len(),
            self.record_types.len(),
            self.classes.len(),
            self.opcodes.len(),
        ]
        .into_iter()
        .try_fold(flag_states, |total, axis| total.checked_mul(axis))
    }

    /// Each flag may appear once; a repeated flag would make its own axis meaningless.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.flags.len());
        if let Some(flag) = self.flags.iter().find(|flag| !seen.insert(**flag)) {
            return Err(FingerprintError::InvalidAxes(format!(
                "flag {} is listed more than once",
                flag
            )));
        }
        if self.combinations().is_none() {
            return Err(FingerprintError::InvalidAxes(
                "axes describe more test cases than can be addressed".to_string(),
            ));
        }
        Ok(())
    }
}

/// One fully specified query template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub domain: String,
    pub record_type: RecordType,
    pub class: DnsClass,
    pub opcode: Opcode,
    pub flags: Vec<HeaderFlag>,
    pub randomize_subdomain: bool,
}

impl TestCase {
    /// The name actually queried, with a random label in front when requested.
    pub fn query_name(&self, random_label: &str) -> String {
        if self.randomize_subdomain && !self.domain.is_empty() {
            format!("{}.{}", random_label, self.domain)
        } else if self.domain.is_empty() {
            ".".to_string()
        } else {
            self.domain.clone()
        }
    }
}

fn derive_name(
    domain: &str,
    record_type: RecordType,
    class: DnsClass,
    opcode: Opcode,
    flags: &[HeaderFlag],
    suffix: Option<&str>,
) -> String {
    let mut tokens = Vec::with_capacity(4 + flags.len());
    if !domain.is_empty() {
        tokens.push(domain.to_string());
    }
    tokens.push(record_type.to_string());
    tokens.push(class.to_string());
    tokens.push(opcode.to_string());
    tokens.extend(flags.iter().map(|flag| flag.to_string()));

    let name = tokens.join("_");
    match suffix {
        Some(suffix) if !suffix.is_empty() => name.replace(suffix, ""),
        _ => name,
    }
}

/// Cartesian product over the axes, last axis varying fastest.
///
/// Fails if two combinations derive the same name, since a scan could not
/// tell which of them a stored result belongs to.
pub fn generate(axes: &QueryAxes) -> Result<Vec<TestCase>> {
    axes.validate()?;
    let flag_count = axes.flags.len();
    let total = axes.combinations().unwrap_or_default();
    let mut cases = Vec::with_capacity(total);
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(total);

    for domain in &axes.domains {
        for record_type in &axes.record_types {
            for class in &axes.classes {
                for opcode in &axes.opcodes {
                    for mask in 0..(1usize << flag_count) {
                        // A set bit means the flag takes its "absent" value
                        let flags: Vec<HeaderFlag> = axes
                            .flags
                            .iter()
                            .enumerate()
                            .filter(|(position, _)| mask & (1 << (flag_count - 1 - position)) == 0)
                            .map(|(_, flag)| *flag)
                            .collect();

                        let name = derive_name(
                            domain,
                            *record_type,
                            *class,
                            *opcode,
                            &flags,
                            axes.domain_suffix.as_deref(),
                        );
                        if seen.insert(name.clone(), cases.len()).is_some() {
                            return Err(FingerprintError::TestCaseCollision { name });
                        }

                        cases.push(TestCase {
                            name,
                            domain: domain.clone(),
                            record_type: *record_type,
                            class: *class,
                            opcode: *opcode,
                            flags,
                            randomize_subdomain: axes.randomize_subdomain,
                        });
                    }
                }
            }
        }
    }

    Ok(cases)
}

/// Like [`generate`], keeping only cases whose name is in `allowed`.
pub fn generate_filtered(axes: &QueryAxes, allowed: &HashSet<String>) -> Result<Vec<TestCase>> {
    Ok(generate(axes)?
        .into_iter()
        .filter(|case| allowed.contains(&case.name))
        .collect())
}
