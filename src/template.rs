//! Template Acquisition
//!
//! Turns a locator into a local, addressable template file. Remote templates
//! are fetched once, with no retry, and written into the operation's
//! artifact scope. Local templates are used in place and never deleted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::artifacts::ArtifactScope;
use crate::error::ReportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum TemplateLocator {
    /// Any HTTP(S) URL returning raw template bytes.
    Url(String),
    /// Document-hosting id, expanded with the configured export pattern.
    DocumentId(String),
    /// Template already on local storage.
    Path(PathBuf),
}

impl TemplateLocator {
    /// Classify free-form input: URLs (share links become ids), else a document id.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with("http://") || input.starts_with("https://") {
            match document_id_from_share_url(input) {
                Some(id) => Self::DocumentId(id),
                None => Self::Url(input.to_string()),
            }
        } else {
            Self::DocumentId(input.to_string())
        }
    }
}

/// Extract `<ID>` from `https://docs.google.com/document/d/<ID>/...`.
fn document_id_from_share_url(url: &str) -> Option<String> {
    let rest = url.split("/document/d/").nth(1)?;
    let id: String = rest.chars().take_while(|c| is_id_char(*c)).collect();
    if id.is_empty() { None } else { Some(id) }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Document ids are substituted into the export URL as-is, so only
/// `[A-Za-z0-9_-]` is accepted.
pub fn is_valid_document_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(is_id_char)
}

/// Template content on local storage. Exclusive to one report operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateHandle {
    /// Caller-owned file.
    Local(PathBuf),
    /// Fetched copy, tracked by the operation's artifact scope.
    Fetched(PathBuf),
}

impl TemplateHandle {
    pub fn path(&self) -> &Path {
        match self {
            Self::Local(p) | Self::Fetched(p) => p,
        }
    }
}

/// Blocking byte fetch. Implementations report non-success status as failure.
pub trait TemplateFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ReportError>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, use_system_proxy: bool) -> Result<Self, ReportError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs));
        if !use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| ReportError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, timeout_secs })
    }
}

impl TemplateFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ReportError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                ReportError::TemplateFetchTimedOut(self.timeout_secs)
            } else {
                ReportError::TemplateFetchFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::TemplateFetchFailed(format!(
                "{url} returned HTTP {}",
                status.as_u16()
            )));
        }

        let bytes = response.bytes().map_err(|e| {
            if e.is_timeout() {
                ReportError::TemplateFetchTimedOut(self.timeout_secs)
            } else {
                ReportError::TemplateFetchFailed(e.to_string())
            }
        })?;
        Ok(bytes.to_vec())
    }
}

/// Resolve `locator` to a local template file.
pub fn acquire(
    locator: &TemplateLocator,
    export_pattern: &str,
    fetcher: &dyn TemplateFetcher,
    scope: &mut ArtifactScope,
) -> Result<TemplateHandle, ReportError> {
    let url = match locator {
        TemplateLocator::Path(path) => {
            if !path.is_file() {
                return Err(ReportError::TemplateFetchFailed(format!(
                    "template file not found: {}",
                    path.display()
                )));
            }
            return Ok(TemplateHandle::Local(path.clone()));
        }
        TemplateLocator::Url(url) => url.clone(),
        TemplateLocator::DocumentId(id) => {
            if !is_valid_document_id(id) {
                return Err(ReportError::TemplateFetchFailed(format!(
                    "invalid document id {id:?}: expected letters, digits, '-' or '_'"
                )));
            }
            export_pattern.replace("{id}", id)
        }
    };

    let bytes = fetcher.fetch(&url)?;
    if bytes.is_empty() {
        return Err(ReportError::TemplateFetchFailed(format!("{url} returned an empty body")));
    }
    let path = scope
        .write("template", "docx", &bytes)
        .map_err(|e| ReportError::PersistFailed(format!("template copy: {e}")))?;
    info!(url = %url, size = bytes.len(), "Template fetched");
    Ok(TemplateHandle::Fetched(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PATTERN: &str = "https://docs.example.com/Export?id={id}&exportFormat=docx";

    struct RecordingFetcher {
        urls: Mutex<Vec<String>>,
        result: fn() -> Result<Vec<u8>, ReportError>,
    }

    impl TemplateFetcher for RecordingFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, ReportError> {
            self.urls.lock().unwrap().push(url.to_string());
            (self.result)()
        }
    }

    #[test]
    fn parse_plain_url() {
        assert_eq!(
            TemplateLocator::parse("https://example.com/t.docx"),
            TemplateLocator::Url("https://example.com/t.docx".into())
        );
    }

    #[test]
    fn parse_share_url_extracts_id() {
        let loc = TemplateLocator::parse("https://docs.google.com/document/d/1AbC-d_E/edit?usp=sharing");
        assert_eq!(loc, TemplateLocator::DocumentId("1AbC-d_E".into()));
    }

    #[test]
    fn bare_id_is_document_id() {
        assert_eq!(TemplateLocator::parse(" 1AbC "), TemplateLocator::DocumentId("1AbC".into()));
    }

    #[test]
    fn fetched_template_is_tracked() {
        let base = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::open(base.path()).unwrap();
        let fetcher = RecordingFetcher {
            urls: Mutex::new(vec![]),
            result: || Ok(b"PK-template".to_vec()),
        };

        let handle = acquire(&TemplateLocator::DocumentId("X1".into()), PATTERN, &fetcher, &mut scope).unwrap();
        assert!(matches!(handle, TemplateHandle::Fetched(_)));
        assert!(handle.path().starts_with(scope.root()));
        assert_eq!(scope.tracked(), &[handle.path().to_path_buf()]);
        assert_eq!(fetcher.urls.lock().unwrap()[0], "https://docs.example.com/Export?id=X1&exportFormat=docx");
    }

    #[test]
    fn document_id_with_url_syntax_is_rejected_before_fetch() {
        let base = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::open(base.path()).unwrap();
        let fetcher = RecordingFetcher {
            urls: Mutex::new(vec![]),
            result: || Ok(b"PK".to_vec()),
        };

        for id in ["X1&exportFormat=pdf", "a b", "../x", "id#frag", ""] {
            let err = acquire(&TemplateLocator::DocumentId(id.into()), PATTERN, &fetcher, &mut scope).unwrap_err();
            assert!(matches!(err, ReportError::TemplateFetchFailed(_)), "{id:?}");
        }
        assert!(fetcher.urls.lock().unwrap().is_empty());
        assert!(scope.tracked().is_empty());
    }

    #[test]
    fn document_id_charset() {
        assert!(is_valid_document_id("1AbC-d_E"));
        assert!(!is_valid_document_id("1AbC?x=1"));
        assert!(!is_valid_document_id("é"));
    }

    #[test]
    fn fetch_failure_writes_nothing() {
        let base = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::open(base.path()).unwrap();
        let fetcher = RecordingFetcher {
            urls: Mutex::new(vec![]),
            result: || Err(ReportError::TemplateFetchFailed("HTTP 404".into())),
        };

        let err = acquire(&TemplateLocator::Url("https://x/t".into()), PATTERN, &fetcher, &mut scope).unwrap_err();
        assert!(matches!(err, ReportError::TemplateFetchFailed(_)));
        assert!(scope.tracked().is_empty());
    }

    #[test]
    fn local_template_is_not_tracked() {
        let base = tempfile::tempdir().unwrap();
        let file = base.path().join("modelo.docx");
        std::fs::write(&file, b"PK").unwrap();
        let mut scope = ArtifactScope::open(base.path()).unwrap();
        let fetcher = RecordingFetcher {
            urls: Mutex::new(vec![]),
            result: || unreachable!(),
        };

        let handle = acquire(&TemplateLocator::Path(file.clone()), PATTERN, &fetcher, &mut scope).unwrap();
        assert_eq!(handle, TemplateHandle::Local(file.clone()));
        scope.release();
        assert!(file.exists());
    }

    #[test]
    fn missing_local_template_fails() {
        let base = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::open(base.path()).unwrap();
        let fetcher = RecordingFetcher {
            urls: Mutex::new(vec![]),
            result: || unreachable!(),
        };
        let err = acquire(
            &TemplateLocator::Path(base.path().join("nope.docx")),
            PATTERN,
            &fetcher,
            &mut scope,
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::TemplateFetchFailed(_)));
    }
}
