//! Canonical identifiers: URL normalisation, work ids, content hashing.
//!
//! Pages are keyed by canonical URL and works by canonical id, so every
//! function here must be deterministic. Re-ingesting the same resource has
//! to land on the same key.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// Query parameters stripped during URL canonicalisation.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "mc_cid",
    "mc_eid",
    "ref",
    "ref_src",
];

/// Normalise a URL into its canonical page key.
///
/// Lower-cases the scheme and host, drops default ports and fragments,
/// strips tracking parameters, and removes a trailing slash from non-root
/// paths.
pub fn canonical_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::invalid_input(format!("unparseable url {:?}: {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::invalid_input(format!(
                "unsupported url scheme {:?}",
                other
            )))
        }
    }

    // Url already lower-cases scheme and host; drop user info and fragment.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);

    // Url::port() returns None for the scheme default, which is what we want
    // serialized, so only an explicit non-default port survives.

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }

    let mut out = url.to_string();
    if out.ends_with('/') && url.path() != "/" {
        out.pop();
    }
    Ok(out)
}

/// Extract the registrable host of a canonical URL.
pub fn url_domain(canonical: &str) -> Result<String> {
    let url = Url::parse(canonical)
        .map_err(|e| Error::invalid_input(format!("unparseable url {:?}: {}", canonical, e)))?;
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_string())
        .ok_or_else(|| Error::invalid_input(format!("url {:?} has no host", canonical)))
}

/// Sha-256 of text, hex-encoded. Used for fragment `text_hash` and page
/// `content_hash`.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A canonical bibliographic identifier.
///
/// Identifiers from different providers map many-to-one onto a work; the
/// canonical form is the string key the `works` table uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalId {
    Doi(String),
    Pmid(String),
    Arxiv(String),
    /// Fallback when no registry identifier is known: hash of the
    /// normalised title.
    TitleHash(String),
}

impl CanonicalId {
    /// Build from a DOI, normalising case and stripping resolver prefixes.
    pub fn from_doi(doi: &str) -> Self {
        let doi = doi.trim().to_lowercase();
        let doi = doi
            .trim_start_matches("https://doi.org/")
            .trim_start_matches("http://doi.org/")
            .trim_start_matches("doi:");
        Self::Doi(doi.to_string())
    }

    /// Build from a PubMed id.
    pub fn from_pmid(pmid: &str) -> Self {
        let pmid = pmid.trim().to_lowercase();
        Self::Pmid(pmid.trim_start_matches("pmid:").to_string())
    }

    /// Build from an arXiv id, dropping any version suffix.
    pub fn from_arxiv(id: &str) -> Self {
        let id = id.trim().to_lowercase();
        let id = id.trim_start_matches("arxiv:").to_string();
        let id = match id.rfind('v') {
            Some(pos) if id[pos + 1..].chars().all(|c| c.is_ascii_digit()) && pos > 0 => {
                id[..pos].to_string()
            }
            _ => id,
        };
        Self::Arxiv(id)
    }

    /// Build the title-hash fallback from a paper title.
    pub fn from_title(title: &str) -> Self {
        let normalised: String = title
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();
        let collapsed = normalised.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::TitleHash(text_hash(&collapsed)[..16].to_string())
    }

    /// The URL to fetch this work from, when one can be derived. Title
    /// hashes have no resolver.
    pub fn fetch_url(&self) -> Option<String> {
        match self {
            Self::Doi(doi) => Some(format!("https://doi.org/{}", doi)),
            Self::Pmid(pmid) => Some(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", pmid)),
            Self::Arxiv(id) => Some(format!("https://arxiv.org/abs/{}", id)),
            Self::TitleHash(_) => None,
        }
    }

    /// The identifier type used by the resource index.
    pub fn identifier_type(&self) -> &'static str {
        match self {
            Self::Doi(_) => "doi",
            Self::Pmid(_) => "pmid",
            Self::Arxiv(_) => "arxiv",
            Self::TitleHash(_) => "title",
        }
    }

    /// Parse a stored canonical id string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("doi", rest)) => Ok(Self::Doi(rest.to_string())),
            Some(("pmid", rest)) => Ok(Self::Pmid(rest.to_string())),
            Some(("arxiv", rest)) => Ok(Self::Arxiv(rest.to_string())),
            Some(("title", rest)) => Ok(Self::TitleHash(rest.to_string())),
            _ => Err(Error::invalid_input(format!("bad canonical id {:?}", s))),
        }
    }
}

impl std::fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Doi(d) => write!(f, "doi:{}", d),
            Self::Pmid(p) => write!(f, "pmid:{}", p),
            Self::Arxiv(a) => write!(f, "arxiv:{}", a),
            Self::TitleHash(h) => write!(f, "title:{}", h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_url_strips_tracking_and_fragment() {
        let c = canonical_url(
            "HTTPS://Example.ORG:443/papers/?utm_source=x&id=7&fbclid=abc#section-2",
        )
        .unwrap();
        assert_eq!(c, "https://example.org/papers/?id=7");
    }

    #[test]
    fn test_canonical_url_is_idempotent() {
        let once = canonical_url("https://example.org/a/b/?utm_medium=mail").unwrap();
        let twice = canonical_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_canonical_url_trailing_slash() {
        let a = canonical_url("https://example.org/path/").unwrap();
        let b = canonical_url("https://example.org/path").unwrap();
        assert_eq!(a, b);
        // Root path keeps its slash.
        assert_eq!(canonical_url("https://example.org/").unwrap(), "https://example.org/");
    }

    #[test]
    fn test_canonical_url_rejects_non_http() {
        assert!(canonical_url("ftp://example.org/file").is_err());
        assert!(canonical_url("not a url").is_err());
    }

    #[test]
    fn test_url_domain() {
        assert_eq!(
            url_domain("https://www.nejm.org/doi/full/10.1056/x").unwrap(),
            "nejm.org"
        );
    }

    #[test]
    fn test_doi_normalisation() {
        let a = CanonicalId::from_doi("https://doi.org/10.1056/NEJMoa1803955");
        let b = CanonicalId::from_doi("doi:10.1056/nejmoa1803955");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "doi:10.1056/nejmoa1803955");
    }

    #[test]
    fn test_arxiv_version_stripped() {
        let a = CanonicalId::from_arxiv("arXiv:2101.00001v3");
        assert_eq!(a.to_string(), "arxiv:2101.00001");
    }

    #[test]
    fn test_title_hash_ignores_case_and_punctuation() {
        let a = CanonicalId::from_title("Aspirin for Primary Prevention: A Meta-Analysis");
        let b = CanonicalId::from_title("aspirin for primary prevention   a meta analysis");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_id_round_trip() {
        for id in [
            CanonicalId::from_doi("10.1000/x"),
            CanonicalId::from_pmid("12345"),
            CanonicalId::from_arxiv("2101.00001"),
            CanonicalId::from_title("Some Paper"),
        ] {
            let parsed = CanonicalId::parse(&id.to_string()).unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn test_fetch_urls() {
        assert_eq!(
            CanonicalId::from_doi("10.1000/x").fetch_url().unwrap(),
            "https://doi.org/10.1000/x"
        );
        assert_eq!(
            CanonicalId::from_arxiv("2101.00001").fetch_url().unwrap(),
            "https://arxiv.org/abs/2101.00001"
        );
        assert!(CanonicalId::from_title("Some Paper").fetch_url().is_none());
    }

    #[test]
    fn test_text_hash_stable() {
        assert_eq!(text_hash("abc"), text_hash("abc"));
        assert_ne!(text_hash("abc"), text_hash("abd"));
        assert_eq!(text_hash("abc").len(), 64);
    }
}
