use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use super::corpus::Granularity;
use super::Model;
use crate::error::{FingerprintError, Result};

/// File locations for one trained granularity inside an artifacts directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir: PathBuf,
    granularity: Option<Granularity>,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, granularity: Option<Granularity>) -> Self {
        Self {
            dir: dir.into(),
            granularity,
        }
    }

    fn named(&self, stem: &str, extension: &str) -> PathBuf {
        match self.granularity {
            Some(granularity) => self.dir.join(format!("{}_{}.{}", stem, granularity, extension)),
            None => self.dir.join(format!("{}.{}", stem, extension)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model(&self) -> PathBuf {
        self.named("model", "json")
    }

    pub fn queries(&self) -> PathBuf {
        self.named("queries", "txt")
    }

    pub fn performance(&self) -> PathBuf {
        self.named("performance", "txt")
    }

    pub fn tree(&self) -> PathBuf {
        self.named("tree", "txt")
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| FingerprintError::file(&self.dir, e))
    }

    pub fn save_model(&self, model: &Model) -> Result<()> {
        self.ensure_dir()?;
        let path = self.model();
        let file = File::create(&path).map_err(|e| FingerprintError::file(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, model)?;
        writer.flush()?;
        info!("model written to {}", path.display());
        Ok(())
    }

    /// Load and validate the model; a broken schema is refused here, before any prediction.
    pub fn load_model(&self) -> Result<Model> {
        let path = self.model();
        let file = File::open(&path).map_err(|e| FingerprintError::file(&path, e))?;
        let model: Model = serde_json::from_reader(BufReader::new(file))?;
        model.validate()?;
        Ok(model)
    }

    pub fn save_important(&self, names: &BTreeSet<String>) -> Result<()> {
        self.ensure_dir()?;
        let path = self.queries();
        let file = File::create(&path).map_err(|e| FingerprintError::file(&path, e))?;
        let mut writer = BufWriter::new(file);
        for name in names {
            writeln!(writer, "{}", name)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_important(&self) -> Result<BTreeSet<String>> {
        let path = self.queries();
        let file = File::open(&path).map_err(|e| FingerprintError::file(&path, e))?;
        let mut names = BTreeSet::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let name = line.trim();
            if !name.is_empty() {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    pub fn save_report(&self, report: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.performance();
        fs::write(&path, report).map_err(|e| FingerprintError::file(&path, e))
    }

    pub fn save_tree(&self, tree: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.tree();
        fs::write(&path, tree).map_err(|e| FingerprintError::file(&path, e))
    }
}
