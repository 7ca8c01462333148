use serde::{Deserialize, Serialize};
use url::Url;

/// An activity whose assets have been fully cached for offline play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineActivity {
    pub name: String,
    pub url: String,
}

impl OfflineActivity {
    /// Builds a record keyed by the canonical form of `url` so the same
    /// activity reached through different fragments is stored once.
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            name: name.into(),
            url: canonical_activity_url(url)?,
        })
    }
}

pub fn canonical_activity_url(raw: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);
    Ok(url.to_string())
}
