//! Soft-404 detection.
//!
//! Many servers answer unknown resources with `200 OK` and a templated error
//! page. For every directory the detector requests a handful of random,
//! certainly-missing resources, refines the bodies against each other to
//! drop the dynamic parts, and later compares suspect bodies against those
//! signatures.
//!
//! The detector itself performs no I/O: the engine asks it for probe URLs,
//! queues them, and feeds the responses back through [`NotFoundDetector::record`].

pub mod refine;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use self::refine::{hash_text, refine, word_hashes};

/// Amount of probe templates issued per directory.
pub const PROBE_TEMPLATES: usize = 5;

/// Detector tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotFoundConfig {
    /// Maximum amount of fingerprinted paths kept after a drain.
    pub cache_size: usize,
    /// How many times each probe template is requested.
    pub precision: usize,
    /// Word-set distance below which a body counts as a not-found page.
    pub word_threshold: usize,
}

impl Default for NotFoundConfig {
    fn default() -> Self {
        Self {
            cache_size: 250,
            precision: 2,
            word_threshold: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("invalid probe url: {0}")]
    Url(#[from] url::ParseError),
    #[error("url has no host: {0}")]
    MissingHost(String),
}

/// Callback receiving a classification verdict.
pub type Verdict = Box<dyn FnOnce(bool) + Send>;

/// A verdict that became available and must be delivered by the caller,
/// outside of any lock.
pub struct Resolution {
    verdict: Verdict,
    is_not_found: bool,
}

impl Resolution {
    pub fn deliver(self) {
        (self.verdict)(self.is_not_found)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("is_not_found", &self.is_not_found)
            .finish()
    }
}

/// Fingerprinting state of a path as seen by [`NotFoundDetector::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Signatures are ready; classify right away.
    Analyzed,
    /// Probes are in flight; defer the classification.
    Probing,
    /// First time this path is seen; the caller has to issue the probes.
    Fresh,
}

#[derive(Debug, Default)]
struct Signature {
    reference: Option<String>,
    diff: Option<String>,
    diff_hash: Option<u64>,
    diff_words: HashSet<u64>,
}

struct PathFingerprint {
    signatures: Vec<Signature>,
    analyzed: bool,
    expected: usize,
    gathered: usize,
    waiters: Vec<(String, Verdict)>,
}

impl PathFingerprint {
    fn new(expected: usize) -> Self {
        Self {
            signatures: (0..PROBE_TEMPLATES).map(|_| Signature::default()).collect(),
            analyzed: false,
            expected,
            gathered: 0,
            waiters: Vec::new(),
        }
    }
}

/// Per-path soft-404 fingerprint cache.
pub struct NotFoundDetector {
    config: NotFoundConfig,
    paths: HashMap<String, PathFingerprint>,
    order: VecDeque<String>,
}

impl fmt::Debug for NotFoundDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotFoundDetector")
            .field("config", &self.config)
            .field("paths", &self.paths.len())
            .finish()
    }
}

impl Default for NotFoundDetector {
    fn default() -> Self {
        Self::new(NotFoundConfig::default())
    }
}

impl NotFoundDetector {
    pub fn new(config: NotFoundConfig) -> Self {
        Self {
            config,
            paths: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &NotFoundConfig {
        &self.config
    }

    /// Amount of probes issued for a fresh path.
    pub fn probes_per_path(&self) -> usize {
        PROBE_TEMPLATES * self.config.precision
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_analyzed(&self, path: &str) -> bool {
        self.paths.get(path).is_some_and(|entry| entry.analyzed)
    }

    /// Looks `path` up, creating a fresh entry when it is unknown.
    pub fn begin(&mut self, path: &str) -> Lookup {
        match self.paths.get(path) {
            Some(entry) if entry.analyzed => Lookup::Analyzed,
            Some(_) => Lookup::Probing,
            None => {
                let expected = self.probes_per_path();
                self.paths.insert(path.to_string(), PathFingerprint::new(expected));
                self.order.push_back(path.to_string());
                Lookup::Fresh
            }
        }
    }

    /// Parks a classification until `path` has been analyzed.
    pub fn defer(&mut self, path: &str, body: String, verdict: Verdict) {
        let Some(analyzed) = self.paths.get(path).map(|entry| entry.analyzed) else {
            verdict(false);
            return;
        };
        if analyzed {
            let is_not_found = self.classify(path, &body);
            verdict(is_not_found);
        } else if let Some(entry) = self.paths.get_mut(path) {
            entry.waiters.push((body, verdict));
        }
    }

    /// Builds the probe URLs for the directory of `url`, tagged with the
    /// signature slot each one feeds.
    pub fn probe_urls(&self, url: &Url) -> Vec<(usize, Result<Url, FingerprintError>)> {
        let precision = self.config.precision;
        let bases = normalize_path(url).and_then(|dir| Ok((dir, parent_dir(url)?)));

        let mut probes = Vec::with_capacity(self.probes_per_path());
        for slot in 0..PROBE_TEMPLATES {
            for _ in 0..precision {
                let probe = match bases {
                    Ok((ref dir, ref parent)) => {
                        let candidate = match slot {
                            0 => format!("{dir}{}.{}", random_token(), extension(precision)),
                            1 => format!("{dir}{}", random_token()),
                            2 => format!("{parent}{}", random_token()),
                            3 => format!("{parent}{}.{}", random_token(), extension(precision)),
                            _ => format!("{dir}{}/", random_token()),
                        };
                        Url::parse(&candidate).map_err(FingerprintError::from)
                    }
                    Err(ref err) => Err(err.clone()),
                };
                probes.push((slot, probe));
            }
        }
        probes
    }

    /// Corrects the expected probe count after one planned probe turned into
    /// `issued` requests (zero when it could not be queued).
    pub fn adjust_expected(&mut self, path: &str, planned: usize, issued: usize) -> Vec<Resolution> {
        let Some(entry) = self.paths.get_mut(path) else {
            return Vec::new();
        };
        if entry.analyzed {
            return Vec::new();
        }
        entry.expected = entry.expected.saturating_sub(planned) + issued;
        self.finalize_if_complete(path)
    }

    /// Feeds a probe response into its slot.
    pub fn record(&mut self, path: &str, slot: usize, body: &str) -> Vec<Resolution> {
        let Some(entry) = self.paths.get_mut(path) else {
            return Vec::new();
        };
        if entry.analyzed {
            return Vec::new();
        }
        if let Some(signature) = entry.signatures.get_mut(slot) {
            let reference = signature.reference.get_or_insert_with(|| body.to_string());
            let diff = refine(reference, body);
            signature.diff_words = word_hashes(&diff);
            signature.diff = Some(diff);
        }
        entry.gathered += 1;
        self.finalize_if_complete(path)
    }

    fn finalize_if_complete(&mut self, path: &str) -> Vec<Resolution> {
        let waiters = match self.paths.get_mut(path) {
            Some(entry) if !entry.analyzed && entry.gathered >= entry.expected => {
                entry.analyzed = true;
                for signature in &mut entry.signatures {
                    signature.diff_hash = signature.diff.take().map(|diff| hash_text(&diff));
                }
                std::mem::take(&mut entry.waiters)
            }
            _ => return Vec::new(),
        };

        log::debug!("Finished 404 fingerprinting for {path}");
        waiters
            .into_iter()
            .map(|(body, verdict)| Resolution {
                is_not_found: self.classify(path, &body),
                verdict,
            })
            .collect()
    }

    /// Classifies `body` against the signatures of an analyzed `path`.
    /// Unknown or unanalyzed paths, and paths without any usable probe,
    /// classify as `false`.
    pub fn classify(&self, path: &str, body: &str) -> bool {
        let Some(entry) = self.paths.get(path).filter(|entry| entry.analyzed) else {
            return false;
        };

        let usable = || {
            entry
                .signatures
                .iter()
                .filter_map(|signature| Some((signature, signature.reference.as_deref()?)))
        };

        for (signature, reference) in usable() {
            if signature.diff_hash == Some(hash_text(&refine(reference, body))) {
                return true;
            }
        }

        for (signature, reference) in usable() {
            let words = word_hashes(&refine(reference, body));
            let distance = signature.diff_words.symmetric_difference(&words).count();
            if distance < self.config.word_threshold {
                return true;
            }
        }

        false
    }

    /// Evicts analyzed paths, oldest first, until the cache fits its capacity.
    /// Paths still being probed are never evicted.
    pub fn prune(&mut self) {
        let capacity = self.config.cache_size;
        if self.paths.len() <= capacity {
            return;
        }

        let mut excess = self.paths.len() - capacity;
        let paths = &mut self.paths;
        self.order.retain(|path| {
            if excess == 0 {
                return true;
            }
            match paths.get(path) {
                Some(entry) if entry.analyzed => {
                    paths.remove(path);
                    excess -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }

    /// Drops every path whose probing did not complete, returning the parked
    /// verdicts so the caller can answer them.
    pub fn discard_incomplete(&mut self) -> Vec<Resolution> {
        let incomplete: Vec<String> = self
            .paths
            .iter()
            .filter(|(_, entry)| !entry.analyzed)
            .map(|(path, _)| path.clone())
            .collect();
        if incomplete.is_empty() {
            return Vec::new();
        }

        let mut resolutions = Vec::new();
        for path in &incomplete {
            if let Some(entry) = self.paths.remove(path) {
                resolutions.extend(entry.waiters.into_iter().map(|(_, verdict)| Resolution {
                    verdict,
                    is_not_found: false,
                }));
            }
        }
        let paths = &self.paths;
        self.order.retain(|path| paths.contains_key(path));
        resolutions
    }
}

/// Directory a URL belongs to: `scheme://host:port/dir/`. A final segment
/// with an extension is dropped and the query is ignored.
pub fn normalize_path(url: &Url) -> Result<String, FingerprintError> {
    let mut path = url.path().to_string();
    if let Some((dir, last)) = path.rsplit_once('/')
        && last.contains('.')
    {
        path = dir.to_string();
    }
    origin(url).map(|origin| format!("{origin}{}", with_trailing_slash(&path)))
}

/// Parent directory of the URL's path: `scheme://host:port/parent/`.
pub fn parent_dir(url: &Url) -> Result<String, FingerprintError> {
    let trimmed = url.path().trim_end_matches('/');
    let parent = match trimmed.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    };
    origin(url).map(|origin| format!("{origin}{}", with_trailing_slash(parent)))
}

fn origin(url: &Url) -> Result<String, FingerprintError> {
    let host = url
        .host_str()
        .ok_or_else(|| FingerprintError::MissingHost(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| FingerprintError::MissingHost(url.to_string()))?;
    Ok(format!("{}://{host}:{port}", url.scheme()))
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// 40 hex characters.
pub fn random_token() -> String {
    rand::random::<[u8; 20]>()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn extension(precision: usize) -> String {
    let token = random_token();
    let len = (precision + 1).min(token.len());
    token[..len].to_string()
}
