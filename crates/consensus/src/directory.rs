//! Known peer endpoints and whether they have been probed yet

use dashmap::DashMap;
use url::Url;

/// Discovery state of one URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Learned through gossip, not contacted yet
    Unprobed,
    /// Contacted once; promoted or not, never retried automatically
    Probed,
}

/// Reduce a peer URL to its root, e.g. `http://h:1/a?b` -> `http://h:1/`
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Every URL this client has heard of
#[derive(Default)]
pub struct PeerDirectory {
    urls: DashMap<String, Discovery>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add URLs not seen before as unprobed; returns how many were new
    pub fn extend<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for raw in urls {
            let Some(root) = normalize_url(raw.as_ref()) else {
                tracing::debug!("Ignoring unusable peer url {:?}", raw.as_ref());
                continue;
            };
            if !self.urls.contains_key(&root) {
                self.urls.insert(root, Discovery::Unprobed);
                added += 1;
            }
        }
        added
    }

    /// Claim every unprobed URL, marking it probed
    pub fn take_unprobed(&self) -> Vec<String> {
        let mut taken = Vec::new();
        for mut entry in self.urls.iter_mut() {
            if *entry.value() == Discovery::Unprobed {
                *entry.value_mut() = Discovery::Probed;
                taken.push(entry.key().clone());
            }
        }
        taken.sort();
        taken
    }

    pub fn state(&self, url: &str) -> Option<Discovery> {
        let root = normalize_url(url)?;
        self.urls.get(&root).map(|r| *r.value())
    }

    /// Every known URL, for saving between runs
    pub fn known_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.urls.iter().map(|r| r.key().clone()).collect();
        urls.sort();
        urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}
