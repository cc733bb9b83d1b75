//! Request and response types for the remote model and fetcher endpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// NLI classification label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NliLabel {
    Entailment,
    Contradiction,
    Neutral,
}

impl NliLabel {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "entailment" => Ok(Self::Entailment),
            "contradiction" => Ok(Self::Contradiction),
            "neutral" => Ok(Self::Neutral),
            other => Err(Error::invalid_input(format!("bad nli label {:?}", other))),
        }
    }
}

impl std::fmt::Display for NliLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entailment => write!(f, "entailment"),
            Self::Contradiction => write!(f, "contradiction"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// A (premise, hypothesis) pair submitted for NLI scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliPair {
    pub premise: String,
    pub hypothesis: String,
}

impl NliPair {
    pub fn new(premise: impl Into<String>, hypothesis: impl Into<String>) -> Self {
        Self {
            premise: premise.into(),
            hypothesis: hypothesis.into(),
        }
    }
}

/// Verdict returned per pair: a label and the raw model probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliVerdict {
    pub label: NliLabel,
    pub probability: f64,
}

impl NliVerdict {
    pub fn new(label: NliLabel, probability: f64) -> Self {
        Self {
            label,
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

/// Options for a fetch call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Use the headful browser instead of the plain HTTP client.
    #[serde(default)]
    pub headful: bool,
    /// Session cookies captured by a human auth resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookies: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headful: false,
            session_cookies: None,
        }
    }

    pub fn headful(mut self) -> Self {
        self.headful = true;
        self
    }

    pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
        self.session_cookies = Some(cookies.into());
        self
    }
}

/// Result of a fetch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: String,
    pub final_url: String,
    pub content_hash: String,
    /// Set when the fetcher hit a CAPTCHA or login wall.
    #[serde(default)]
    pub auth_required: bool,
    /// Canonical work id when the fetcher recognised a bibliographic
    /// record (doi:, pmid:, arxiv:, title:).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
}
