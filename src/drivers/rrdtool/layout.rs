//! Tag-to-path strategies
//!
//! RRD files have no tags of their own, so a measurement and its tag set are
//! encoded into the file location:
//!
//! | strategy | `cpu` with `host=a, dc=eu` |
//! |----------|----------------------------|
//! | flat     | `cpu__dc=eu__host=a.rrd`   |
//! | folder   | `cpu/dc=eu/host=a/cpu.rrd` |
//! | none     | `cpu.rrd`                  |

use crate::config::TagStrategyKind;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXTENSION: &str = "rrd";
const FLAT_SEPARATOR: &str = "__";

pub type Tags = BTreeMap<String, String>;

/// An RRD file found on disk, with the tags its location encodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrdFile {
    pub path: PathBuf,
    pub tags: Tags,
}

/// Maps (measurement, tags) to a file and back
pub trait TagStrategy: Debug + Send + Sync {
    fn path(&self, base: &Path, measurement: &str, tags: &Tags) -> PathBuf;

    /// Measurements with at least one file under `base`
    fn measurements(&self, base: &Path) -> io::Result<Vec<String>>;

    /// Files of one measurement
    fn files(&self, base: &Path, measurement: &str) -> io::Result<Vec<RrdFile>>;
}

pub fn strategy_for(kind: TagStrategyKind) -> Arc<dyn TagStrategy> {
    match kind {
        TagStrategyKind::Flat => Arc::new(FlatStrategy),
        TagStrategyKind::Folder => Arc::new(FolderStrategy),
        TagStrategyKind::None => Arc::new(NoTagsStrategy),
    }
}

/// Path components cannot contain separators
fn component(s: &str) -> String {
    s.chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}

fn parse_pair(s: &str) -> Option<(String, String)> {
    let (key, value) = s.split_once('=')?;
    Some((key.to_string(), value.to_string()))
}

/// `.rrd` file stems directly inside `dir`; a missing dir has none
fn rrd_stems(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut stems = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
    }
    stems.sort();
    Ok(stems)
}

/// All tags in the file name
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatStrategy;

impl TagStrategy for FlatStrategy {
    fn path(&self, base: &Path, measurement: &str, tags: &Tags) -> PathBuf {
        let mut name = component(measurement);
        for (key, value) in tags {
            name.push_str(FLAT_SEPARATOR);
            name.push_str(&format!("{}={}", component(key), component(value)));
        }
        base.join(format!("{}.{}", name, EXTENSION))
    }

    fn measurements(&self, base: &Path) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = rrd_stems(base)?
            .into_iter()
            .filter_map(|stem| stem.split(FLAT_SEPARATOR).next().map(str::to_string))
            .collect();
        names.dedup();
        Ok(names)
    }

    fn files(&self, base: &Path, measurement: &str) -> io::Result<Vec<RrdFile>> {
        let measurement = component(measurement);
        Ok(rrd_stems(base)?
            .into_iter()
            .filter_map(|stem| {
                let mut parts = stem.split(FLAT_SEPARATOR);
                if parts.next()? != measurement {
                    return None;
                }
                let tags = parts.filter_map(parse_pair).collect();
                Some(RrdFile {
                    path: base.join(format!("{}.{}", stem, EXTENSION)),
                    tags,
                })
            })
            .collect())
    }
}

/// One directory level per tag
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStrategy;

impl FolderStrategy {
    fn walk(dir: &Path, file_name: &str, tags: &Tags, out: &mut Vec<RrdFile>) -> io::Result<()> {
        let candidate = dir.join(file_name);
        if candidate.is_file() {
            out.push(RrdFile {
                path: candidate,
                tags: tags.clone(),
            });
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some((key, value)) = path.file_name().and_then(|n| n.to_str()).and_then(parse_pair) else {
                continue;
            };
            let mut nested = tags.clone();
            nested.insert(key, value);
            Self::walk(&path, file_name, &nested, out)?;
        }
        Ok(())
    }
}

impl TagStrategy for FolderStrategy {
    fn path(&self, base: &Path, measurement: &str, tags: &Tags) -> PathBuf {
        let measurement = component(measurement);
        let mut path = base.join(&measurement);
        for (key, value) in tags {
            path.push(format!("{}={}", component(key), component(value)));
        }
        path.join(format!("{}.{}", measurement, EXTENSION))
    }

    fn measurements(&self, base: &Path) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if path.is_dir() && !self.files(base, name)?.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn files(&self, base: &Path, measurement: &str) -> io::Result<Vec<RrdFile>> {
        let measurement = component(measurement);
        let root = base.join(&measurement);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        Self::walk(&root, &format!("{}.{}", measurement, EXTENSION), &Tags::new(), &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

/// One file per measurement; tags are dropped
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTagsStrategy;

impl TagStrategy for NoTagsStrategy {
    fn path(&self, base: &Path, measurement: &str, _tags: &Tags) -> PathBuf {
        base.join(format!("{}.{}", component(measurement), EXTENSION))
    }

    fn measurements(&self, base: &Path) -> io::Result<Vec<String>> {
        rrd_stems(base)
    }

    fn files(&self, base: &Path, measurement: &str) -> io::Result<Vec<RrdFile>> {
        let path = self.path(base, measurement, &Tags::new());
        Ok(if path.is_file() {
            vec![RrdFile {
                path,
                tags: Tags::new(),
            }]
        } else {
            Vec::new()
        })
    }
}
