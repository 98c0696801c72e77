//! Materialization of bundled model weights onto writable storage.
//!
//! Bundled assets are grouped by variant directory (`models-se`, ...). A group
//! is copied file by file into `<model_root>/<group>/`; files already present
//! are left untouched, so repeated calls are cheap and never rewrite good data.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::AssetError;
use crate::variant::ModelVariant;

/// Read-only source of bundled model files.
pub trait AssetSource: Send + Sync {
    /// File names directly inside `group`. Missing groups yield an empty list
    /// or `NotFound`.
    fn list(&self, group: &str) -> io::Result<Vec<String>>;

    fn open(&self, group: &str, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Assets laid out as `<root>/<group>/<file>` on disk, e.g. an installed
/// package's `share/cugan/models`.
#[derive(Debug, Clone)]
pub struct DirAssetSource {
    root: PathBuf,
}

impl DirAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirAssetSource {
    fn list(&self, group: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(group))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn open(&self, group: &str, name: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.root.join(group).join(name))?;
        Ok(Box::new(file))
    }
}

/// In-memory asset bundle.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetSource {
    groups: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: &str, name: &str, bytes: impl Into<Vec<u8>>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), bytes.into());
    }

    pub fn with_file(mut self, group: &str, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(group, name, bytes);
        self
    }
}

impl AssetSource for MemoryAssetSource {
    fn list(&self, group: &str) -> io::Result<Vec<String>> {
        Ok(self
            .groups
            .get(group)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn open(&self, group: &str, name: &str) -> io::Result<Box<dyn Read + Send>> {
        let bytes = self
            .groups
            .get(group)
            .and_then(|files| files.get(name))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{group}/{name}")))?;
        Ok(Box::new(Cursor::new(bytes.clone())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub variant: ModelVariant,
    pub dir: PathBuf,
    pub copied: usize,
    pub skipped: usize,
}

/// Ensures every bundled file of `variant` exists under
/// `<model_root>/<variant dir>/`. Returns the variant directory.
///
/// Files are written to a unique temporary name and renamed into place, so a
/// concurrent materialization of the same variant never observes a partial
/// file under its final name.
pub fn materialize(
    source: &dyn AssetSource,
    variant: ModelVariant,
    model_root: &Path,
) -> Result<MaterializeReport, AssetError> {
    let group = variant.dir();
    let names = match source.list(group) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(source) => {
            return Err(AssetError::List {
                group: group.to_string(),
                source,
            })
        }
    };
    if names.is_empty() {
        return Err(AssetError::MissingGroup {
            group: group.to_string(),
        });
    }

    let dest_dir = model_root.join(group);
    fs::create_dir_all(&dest_dir).map_err(|source| AssetError::Write {
        path: dest_dir.clone(),
        source,
    })?;

    let mut report = MaterializeReport {
        variant,
        dir: dest_dir.clone(),
        copied: 0,
        skipped: 0,
    };

    for name in &names {
        let final_path = dest_dir.join(name);
        if final_path.is_file() {
            report.skipped += 1;
            continue;
        }
        copy_one(source, group, name, &final_path)?;
        debug!(file = %final_path.display(), "Materialized model file");
        report.copied += 1;
    }

    info!(
        variant = %variant,
        dir = %report.dir.display(),
        copied = report.copied,
        skipped = report.skipped,
        "Model assets ready"
    );
    Ok(report)
}

/// Materializes every built-in variant.
pub fn materialize_all(
    source: &dyn AssetSource,
    model_root: &Path,
) -> Result<Vec<MaterializeReport>, AssetError> {
    ModelVariant::ALL
        .into_iter()
        .map(|variant| materialize(source, variant, model_root))
        .collect()
}

fn copy_one(
    source: &dyn AssetSource,
    group: &str,
    name: &str,
    final_path: &Path,
) -> Result<(), AssetError> {
    let read_err = |source| AssetError::Read {
        group: group.to_string(),
        name: name.to_string(),
        source,
    };

    let mut reader = source.open(group, name).map_err(read_err)?;

    let tmp_path = final_path.with_file_name(format!(".{name}.{}.part", uuid::Uuid::new_v4()));
    let write_err = |source| AssetError::Write {
        path: tmp_path.clone(),
        source,
    };

    let result = (|| -> Result<(), AssetError> {
        let mut tmp_file = fs::File::create(&tmp_path).map_err(write_err)?;
        io::copy(&mut reader, &mut tmp_file).map_err(write_err)?;
        tmp_file.sync_all().map_err(write_err)?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    // Another materializer may have won the race; its file is complete, and
    // rename replaces it atomically with identical content.
    fs::rename(&tmp_path, final_path).map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        AssetError::Write {
            path: final_path.to_path_buf(),
            source,
        }
    })
}
