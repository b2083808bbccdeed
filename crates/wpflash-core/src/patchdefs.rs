//! Declarative file patching driven by XML patch definitions.
//!
//! A patch definition names a set of target versions; each version
//! lists files with their SHA-1 before and after patching, plus the
//! byte-level edits. Files are re-hashed before every decision, so
//! state is always derived from what is actually on disk rather than
//! from anything remembered between calls. Versions are tried in
//! document order and the first one whose files all account for
//! themselves wins.
//!
//! Obsolete entries describe the patched state of earlier releases of
//! the same definition. A file found in such a state is first reverted
//! to its original bytes and then patched forward, which migrates
//! devices across patch revisions without a separate tool.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bytes::parse_hex_u64;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("unknown patch definition: {0}")]
    UnknownDefinition(String),

    #[error("patch definition parse error: {0}")]
    Xml(String),

    #[error("bad patch data in {context}: {reason}")]
    BadDefinition { context: String, reason: String },

    #[error("hash mismatch for {path} after patching: expected {expected}, found {found}")]
    HashMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("patch does not match {path} at offset 0x{offset:X}")]
    ByteMismatch { path: String, offset: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct PatchDefinitions {
    #[serde(rename = "PatchDefinition", default)]
    pub definitions: Vec<PatchDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct PatchDefinition {
    #[serde(rename = "@Name")]
    pub name: String,
    #[serde(rename = "TargetVersion", default)]
    pub versions: Vec<TargetVersion>,
}

#[derive(Debug, Deserialize)]
pub struct TargetVersion {
    #[serde(rename = "@Description", default)]
    pub description: String,
    #[serde(rename = "TargetFile", default)]
    pub files: Vec<TargetFile>,
}

#[derive(Debug, Deserialize)]
pub struct TargetFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "HashOriginal")]
    pub hash_original: String,
    #[serde(rename = "HashPatched")]
    pub hash_patched: String,
    #[serde(rename = "Patch", default)]
    pub patches: Vec<Patch>,
    #[serde(rename = "Obsolete", default)]
    pub obsolete: Vec<ObsoleteVersion>,
}

/// Patched state of an earlier revision of the same definition.
#[derive(Debug, Deserialize)]
pub struct ObsoleteVersion {
    #[serde(rename = "HashPatched")]
    pub hash_patched: String,
    #[serde(rename = "Patch", default)]
    pub patches: Vec<Patch>,
}

#[derive(Debug, Deserialize)]
pub struct Patch {
    #[serde(rename = "@Offset")]
    pub offset: String,
    #[serde(rename = "OriginalBytes")]
    pub original: String,
    #[serde(rename = "PatchedBytes")]
    pub patched: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    AlreadyApplied,
    NotApplicable,
}

/// How a file on disk relates to its TargetFile entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Original,
    Patched,
    Obsolete(usize),
}

pub struct PatchEngine {
    definitions: PatchDefinitions,
    /// Maps definition paths to actual filesystem locations, e.g. when
    /// the target volume is mounted somewhere else.
    redirections: Vec<(String, PathBuf)>,
}

impl PatchEngine {
    pub fn parse(xml: &str) -> Result<Self, PatchError> {
        let definitions: PatchDefinitions =
            quick_xml::de::from_str(xml).map_err(|e| PatchError::Xml(e.to_string()))?;
        Ok(Self {
            definitions,
            redirections: Vec::new(),
        })
    }

    pub fn add_redirection(&mut self, from: impl Into<String>, to: impl Into<PathBuf>) {
        self.redirections.push((from.into(), to.into()));
    }

    fn resolve(&self, path: &str) -> PathBuf {
        for (from, to) in &self.redirections {
            if from.eq_ignore_ascii_case(path) {
                return to.clone();
            }
        }
        PathBuf::from(path)
    }

    fn hash_file(path: &Path) -> Result<String, PatchError> {
        let contents = fs::read(path)?;
        let mut hasher = Sha1::new();
        hasher.update(&contents);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Classify a file by hashing it right now. `None` means the file
    /// matches no known state.
    fn classify(&self, file: &TargetFile) -> Result<Option<FileState>, PatchError> {
        let path = self.resolve(&file.path);
        if !path.exists() {
            return Ok(None);
        }
        let hash = Self::hash_file(&path)?;
        if hash.eq_ignore_ascii_case(&file.hash_original) {
            return Ok(Some(FileState::Original));
        }
        if hash.eq_ignore_ascii_case(&file.hash_patched) {
            return Ok(Some(FileState::Patched));
        }
        for (i, obsolete) in file.obsolete.iter().enumerate() {
            if hash.eq_ignore_ascii_case(&obsolete.hash_patched) {
                return Ok(Some(FileState::Obsolete(i)));
            }
        }
        Ok(None)
    }

    /// Find the first version whose files all classify, with their
    /// states.
    fn match_version<'a>(
        &self,
        definition: &'a PatchDefinition,
    ) -> Result<Option<(&'a TargetVersion, Vec<FileState>)>, PatchError> {
        'versions: for version in &definition.versions {
            let mut states = Vec::with_capacity(version.files.len());
            for file in &version.files {
                match self.classify(file)? {
                    Some(state) => states.push(state),
                    None => continue 'versions,
                }
            }
            return Ok(Some((version, states)));
        }
        Ok(None)
    }

    fn edit_file(
        &self,
        file: &TargetFile,
        patches: &[Patch],
        reverse: bool,
        expected_hash: &str,
    ) -> Result<(), PatchError> {
        let path = self.resolve(&file.path);
        let mut contents = fs::read(&path)?;

        for patch in patches {
            let offset = parse_hex_u64(&patch.offset).ok_or_else(|| {
                PatchError::BadDefinition {
                    context: file.path.clone(),
                    reason: format!("offset {:?} is not hex", patch.offset),
                }
            })? as usize;
            let decode = |s: &str| {
                hex::decode(s).map_err(|e| PatchError::BadDefinition {
                    context: file.path.clone(),
                    reason: e.to_string(),
                })
            };
            let (from, to) = if reverse {
                (decode(&patch.patched)?, decode(&patch.original)?)
            } else {
                (decode(&patch.original)?, decode(&patch.patched)?)
            };
            if from.len() != to.len() {
                return Err(PatchError::BadDefinition {
                    context: file.path.clone(),
                    reason: "original and patched bytes differ in length".into(),
                });
            }
            if offset + from.len() > contents.len()
                || contents[offset..offset + from.len()] != from[..]
            {
                return Err(PatchError::ByteMismatch {
                    path: file.path.clone(),
                    offset: offset as u64,
                });
            }
            contents[offset..offset + to.len()].copy_from_slice(&to);
        }

        fs::write(&path, &contents)?;

        let hash = Self::hash_file(&path)?;
        if !hash.eq_ignore_ascii_case(expected_hash) {
            return Err(PatchError::HashMismatch {
                path: file.path.clone(),
                expected: expected_hash.to_ascii_lowercase(),
                found: hash,
            });
        }
        Ok(())
    }

    fn definition(&self, name: &str) -> Result<&PatchDefinition, PatchError> {
        self.definitions
            .definitions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| PatchError::UnknownDefinition(name.to_string()))
    }

    /// Apply a patch definition to the files it targets.
    #[instrument(skip(self))]
    pub fn apply(&self, name: &str) -> Result<PatchOutcome, PatchError> {
        let definition = self.definition(name)?;
        let Some((version, states)) = self.match_version(definition)? else {
            info!(name, "No target version matches, patch not applicable");
            return Ok(PatchOutcome::NotApplicable);
        };
        debug!(version = %version.description, "Target version matched");

        let mut touched = false;
        for (file, state) in version.files.iter().zip(states) {
            match state {
                FileState::Patched => {
                    debug!(path = %file.path, "Already patched");
                }
                FileState::Obsolete(i) => {
                    debug!(path = %file.path, revision = i, "Reverting obsolete patch");
                    self.edit_file(
                        file,
                        &file.obsolete[i].patches,
                        true,
                        &file.hash_original,
                    )?;
                    self.edit_file(file, &file.patches, false, &file.hash_patched)?;
                    touched = true;
                }
                FileState::Original => {
                    self.edit_file(file, &file.patches, false, &file.hash_patched)?;
                    touched = true;
                }
            }
        }

        if touched {
            info!(name, "Patch applied");
            Ok(PatchOutcome::Applied)
        } else {
            Ok(PatchOutcome::AlreadyApplied)
        }
    }

    /// Undo a patch definition. Files already in their original state
    /// are left alone; if nothing matches at all this logs and returns.
    #[instrument(skip(self))]
    pub fn restore(&self, name: &str) -> Result<(), PatchError> {
        let definition = self.definition(name)?;
        let Some((version, states)) = self.match_version(definition)? else {
            warn!(name, "No target version matches, nothing to restore");
            return Ok(());
        };

        for (file, state) in version.files.iter().zip(states) {
            match state {
                FileState::Original => {
                    debug!(path = %file.path, "Already original");
                }
                FileState::Patched => {
                    self.edit_file(file, &file.patches, true, &file.hash_original)?;
                }
                FileState::Obsolete(i) => {
                    self.edit_file(
                        file,
                        &file.obsolete[i].patches,
                        true,
                        &file.hash_original,
                    )?;
                }
            }
        }
        info!(name, "Patch restored");
        Ok(())
    }
}
