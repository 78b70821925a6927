//! Upstream archive ingestion into the corpus store.
//!
//! A one-shot bootstrap, run when the corpus directory is absent at
//! startup: download the consensus-spec-tests release assets, extract
//! the `.tar.gz` trees into a staging directory, then walk them for
//! Snappy-framed seed vectors and deposit the decompressed payloads
//! into the content-addressed store.
//!
//! Ingestion is strictly additive and idempotent: existing corpus
//! entries are left alone, and re-running against the same release
//! produces the same tree. Individual bad files are logged and
//! skipped; only an entirely empty harvest is an error.

use crate::corpus::{CorpusError, CorpusStore};
use flate2::read::GzDecoder;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Release assets the ingestor looks for.
pub const WANTED_ASSETS: [&str; 3] = ["general.tar.gz", "mainnet.tar.gz", "minimal.tar.gz"];

const RELEASES_URL: &str =
    "https://api.github.com/repos/ethereum/consensus-spec-tests/releases";

/// Errors that abort the whole bootstrap. Per-file problems never land
/// here; they are logged and skipped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("GITHUB_TOKEN is not set; cannot bootstrap the corpus")]
    MissingToken,

    #[error("upstream request failed: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("release listing is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no releases found upstream")]
    NoReleases,

    #[error("ingest I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("no seed vectors ingested from release {tag}")]
    NothingIngested { tag: String },
}

/// One upstream release.
#[derive(Debug, Clone)]
pub struct Release {
    pub tag: String,
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub url: String,
}

/// Source of release archives. The driver only ever sees this trait;
/// the GitHub implementation below is one provider, the test suite
/// supplies in-memory ones.
pub trait ReleaseProvider {
    /// All releases, newest first.
    fn list_releases(&self) -> Result<Vec<Release>, IngestError>;

    /// Stream the bytes behind an asset URL.
    fn fetch(&self, url: &str) -> Result<Box<dyn Read>, IngestError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  GitHub provider
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RawRelease {
    tag_name: String,
    assets: Vec<RawAsset>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    name: String,
    browser_download_url: String,
}

/// Release provider backed by the GitHub API.
pub struct GithubProvider {
    agent: ureq::Agent,
    token: String,
}

impl GithubProvider {
    /// Build a provider from `GITHUB_TOKEN`. The token is consumed here
    /// and nowhere else; without it the ingestor refuses to run (an
    /// already-populated corpus needs no token at all).
    pub fn from_env() -> Result<Self, IngestError> {
        let token = std::env::var("GITHUB_TOKEN").map_err(|_| IngestError::MissingToken)?;
        if token.is_empty() {
            return Err(IngestError::MissingToken);
        }
        Ok(Self {
            agent: ureq::Agent::new(),
            token,
        })
    }

    fn get(&self, url: &str) -> Result<ureq::Response, IngestError> {
        self.agent
            .get(url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("User-Agent", "ethdiff")
            .call()
            .map_err(|e| IngestError::Http(Box::new(e)))
    }
}

impl ReleaseProvider for GithubProvider {
    fn list_releases(&self) -> Result<Vec<Release>, IngestError> {
        let response = self.get(RELEASES_URL)?;
        let raw: Vec<RawRelease> = serde_json::from_reader(response.into_reader())?;
        Ok(raw
            .into_iter()
            .map(|release| Release {
                tag: release.tag_name,
                assets: release
                    .assets
                    .into_iter()
                    .map(|asset| Asset {
                        name: asset.name,
                        url: asset.browser_download_url,
                    })
                    .collect(),
            })
            .collect())
    }

    fn fetch(&self, url: &str) -> Result<Box<dyn Read>, IngestError> {
        Ok(Box::new(self.get(url)?.into_reader()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Ingestion
// ═══════════════════════════════════════════════════════════════════════

/// What a bootstrap run deposited.
#[derive(Debug, Default)]
pub struct IngestSummary {
    /// Total seed vectors deposited (idempotent re-deposits included).
    pub deposited: usize,
    /// Deposits per `fork/object` category.
    pub per_category: BTreeMap<String, usize>,
}

/// One-shot corpus bootstrap against a [`ReleaseProvider`].
pub struct Ingestor<P> {
    provider: P,
    staging: PathBuf,
}

impl<P: ReleaseProvider> Ingestor<P> {
    /// `staging` holds the extracted archive trees; it is left in place
    /// afterwards so a re-run can skip the download step by hand.
    pub fn new(provider: P, staging: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            staging: staging.into(),
        }
    }

    /// Download, extract and deposit. Fails only on structural problems
    /// (no releases, nothing ingested at all); bad individual files are
    /// skipped with a warning.
    pub fn run(&self, store: &CorpusStore) -> Result<IngestSummary, IngestError> {
        let releases = self.provider.list_releases()?;
        let release = releases.first().ok_or(IngestError::NoReleases)?;
        log::info!("ingesting release {}", release.tag);

        fs::create_dir_all(&self.staging)?;
        for wanted in WANTED_ASSETS {
            match release.assets.iter().find(|asset| asset.name == wanted) {
                Some(asset) => {
                    log::info!("downloading {}", asset.name);
                    let reader = self.provider.fetch(&asset.url)?;
                    extract_tar_gz(reader, &self.staging)?;
                }
                None => log::warn!("asset {wanted} not present in release {}", release.tag),
            }
        }

        let summary = self.populate(store)?;
        if summary.deposited == 0 {
            return Err(IngestError::NothingIngested {
                tag: release.tag.clone(),
            });
        }
        Ok(summary)
    }

    /// Walk the extracted trees and deposit every matching vector.
    fn populate(&self, store: &CorpusStore) -> Result<IngestSummary, IngestError> {
        let tests_root = self.staging.join("tests").join("mainnet");
        let forks = list_dirs(&tests_root);
        if forks.is_empty() {
            log::warn!("no fork directories under {}", tests_root.display());
        }

        let mut summary = IngestSummary::default();

        // Beacon states: every pre/post state below the fork tree.
        for fork in &forks {
            self.populate_category(
                store,
                &tests_root.join(fork),
                fork,
                "BeaconState",
                r".*/(pre|post)\.ssz_snappy",
                &mut summary,
            );
        }

        // Static SSZ objects, one category per ssz_static subdirectory.
        for fork in &forks {
            for object in list_dirs(&tests_root.join(fork).join("ssz_static")) {
                let pattern = format!(r"/{object}/.*\.ssz_snappy");
                self.populate_category(
                    store,
                    &tests_root.join(fork),
                    fork,
                    &object,
                    &pattern,
                    &mut summary,
                );
            }
        }

        Ok(summary)
    }

    fn populate_category(
        &self,
        store: &CorpusStore,
        fork_root: &Path,
        fork: &str,
        object: &str,
        pattern: &str,
        summary: &mut IngestSummary,
    ) {
        // Object names come from directory listings; they are plain
        // type names and never contain regex metacharacters.
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                log::warn!("bad pattern for {fork}/{object}: {e}");
                return;
            }
        };

        let mut files = Vec::new();
        if let Err(e) = walk_files(fork_root, &mut files) {
            log::warn!("walking {} failed: {e}", fork_root.display());
            return;
        }

        let mut count = 0;
        for path in files {
            if !regex.is_match(&path.to_string_lossy()) {
                continue;
            }
            match deposit_snappy_vector(store, fork, object, &path) {
                Ok(()) => count += 1,
                Err(e) => log::warn!("skipping {}: {e}", path.display()),
            }
        }

        if count == 0 {
            log::warn!("no files for {fork}.{object} (pattern: {pattern})");
        } else {
            log::info!("populated {fork}.{object} (count: {count}) (pattern: {pattern})");
            summary.deposited += count;
            *summary
                .per_category
                .entry(format!("{fork}/{object}"))
                .or_insert(0) += count;
        }
    }
}

/// Decompress one raw-Snappy vector and deposit it. Seed files are a
/// few MB at most, so single-shot decompression is fine.
fn deposit_snappy_vector(
    store: &CorpusStore,
    fork: &str,
    object: &str,
    path: &Path,
) -> Result<(), IngestError> {
    let compressed = fs::read(path)?;
    let payload = snap::raw::Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    store.deposit(fork, object, &payload)?;
    Ok(())
}

/// Extract a `.tar.gz` stream into `dest`. Regular files and
/// directories are honored; symlinks and other entry types are skipped
/// with a warning. A bad entry skips that entry only.
fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<(), IngestError> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    for entry in archive.entries()? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("unreadable archive entry: {e}");
                continue;
            }
        };
        let kind = entry.header().entry_type();
        match kind {
            tar::EntryType::Regular | tar::EntryType::Directory => {
                if let Err(e) = entry.unpack_in(dest) {
                    log::warn!("failed to unpack archive entry: {e}");
                }
            }
            other => {
                let name = entry
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "<unreadable>".to_string());
                log::warn!("skipping {other:?} entry: {name}");
            }
        }
    }
    Ok(())
}

/// Immediate subdirectory names of `dir`, sorted. Missing directories
/// are treated as empty; absence of a tree is a per-category problem,
/// not a fatal one.
fn list_dirs(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut dirs: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    dirs
}

/// Recursively collect regular files under `dir`.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}
