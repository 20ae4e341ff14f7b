//! Paperless-ngx document upload.
//!
//! Tags are sent as numeric ids. Names are resolved against the server's
//! tag list (case-insensitive) and created when missing.

use crate::config::PaperlessConfig;
use crate::error::PaperlessError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const POST_DOCUMENT_PATH: &str = "/api/documents/post_document/";
const TAGS_PATH: &str = "/api/tags/";
const TAG_PAGE_SIZE: u32 = 50;
/// Large scans can take a while to be accepted.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

/// A document ready for upload.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Required; also used as the uploaded file name.
    pub title: String,
    /// RFC 3339 timestamp.
    pub created: Option<String>,
    pub correspondent: Option<u32>,
    pub document_type: Option<u32>,
    pub storage_path: Option<u32>,
    pub archive_serial_number: Option<String>,
    /// Tag names, already cleaned.
    pub tags: Vec<String>,
    pub data: Vec<u8>,
}

/// Destination for finished documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upload(&self, document: Document) -> Result<(), PaperlessError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagPage {
    next: Option<String>,
    #[serde(default)]
    results: Vec<TagRecord>,
}

/// Id of the tag named `name` (compared case-insensitively). Id 0 is not a
/// real tag and never matches.
pub fn find_tag_id(tags: &[TagRecord], name: &str) -> Option<u64> {
    let wanted = name.to_lowercase();
    tags.iter()
        .filter(|tag| tag.id != 0)
        .find(|tag| tag.name.to_lowercase() == wanted)
        .map(|tag| tag.id)
}

pub struct PaperlessClient {
    http: reqwest::Client,
    base_url: String,
    defaults: PaperlessConfig,
}

impl PaperlessClient {
    pub fn new(config: &PaperlessConfig) -> Result<Self, PaperlessError> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&format!("Token {}", config.token))
            .map_err(|e| PaperlessError::Http(format!("invalid token: {e}")))?;
        headers.insert(AUTHORIZATION, token);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| PaperlessError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            defaults: config.clone(),
        })
    }

    /// Correspondent, document type and storage path from the config, used
    /// when a document leaves them unset.
    pub fn with_defaults(&self, mut document: Document) -> Document {
        document.correspondent = document.correspondent.or(self.defaults.correspondent);
        document.document_type = document.document_type.or(self.defaults.document_type);
        document.storage_path = document.storage_path.or(self.defaults.storage_path);
        document
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Every tag on the server, following pagination until `next` is null.
    pub async fn list_tags(&self) -> Result<Vec<TagRecord>, PaperlessError> {
        let mut tags = Vec::new();
        for number in 1u32.. {
            let response = self
                .http
                .get(self.url(TAGS_PATH))
                .query(&[("page_size", TAG_PAGE_SIZE), ("page", number)])
                .send()
                .await
                .map_err(|e| PaperlessError::Http(e.to_string()))?;
            let body = expect_status(response, "list tags", StatusCode::OK).await?;
            let page: TagPage = serde_json::from_str(&body).map_err(|e| PaperlessError::Decode {
                operation: "list tags",
                detail: e.to_string(),
            })?;
            tags.extend(page.results);
            if page.next.is_none() {
                break;
            }
        }
        Ok(tags)
    }

    async fn create_tag(&self, name: &str) -> Result<TagRecord, PaperlessError> {
        let response = self
            .http
            .post(self.url(TAGS_PATH))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| PaperlessError::Http(e.to_string()))?;
        let body = expect_status(response, "create tag", StatusCode::CREATED).await?;
        let tag: TagRecord = serde_json::from_str(&body).map_err(|e| PaperlessError::Decode {
            operation: "create tag",
            detail: e.to_string(),
        })?;
        if tag.id == 0 {
            return Err(PaperlessError::Decode {
                operation: "create tag",
                detail: format!("server returned no id for tag '{name}'"),
            });
        }
        info!(tag = %tag.name, id = tag.id, "Created Paperless tag");
        Ok(tag)
    }

    /// Ids for `names`, creating the tags that do not exist yet.
    pub async fn resolve_tags(&self, names: &[String]) -> Result<Vec<u64>, PaperlessError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut known = self.list_tags().await?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = match find_tag_id(&known, name) {
                Some(id) => id,
                None => {
                    let created = self.create_tag(name).await?;
                    let id = created.id;
                    known.push(created);
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }
}

async fn expect_status(
    response: reqwest::Response,
    operation: &'static str,
    expected: StatusCode,
) -> Result<String, PaperlessError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PaperlessError::Http(e.to_string()))?;
    if status != expected {
        return Err(PaperlessError::Status {
            operation,
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn upload_form(document: Document, tag_ids: &[u64]) -> Result<Form, PaperlessError> {
    let mut form = Form::new().text("title", document.title.clone());
    if let Some(created) = document.created {
        form = form.text("created", created);
    }
    if let Some(id) = document.correspondent {
        form = form.text("correspondent", id.to_string());
    }
    if let Some(id) = document.document_type {
        form = form.text("document_type", id.to_string());
    }
    if let Some(id) = document.storage_path {
        form = form.text("storage_path", id.to_string());
    }
    if let Some(asn) = document.archive_serial_number {
        form = form.text("archive_serial_number", asn);
    }
    for id in tag_ids {
        form = form.text("tags", id.to_string());
    }
    let part = Part::bytes(document.data)
        .file_name(document.title)
        .mime_str("application/pdf")
        .map_err(|e| PaperlessError::Http(e.to_string()))?;
    Ok(form.part("document", part))
}

#[async_trait]
impl DocumentStore for PaperlessClient {
    async fn upload(&self, document: Document) -> Result<(), PaperlessError> {
        if document.title.is_empty() {
            return Err(PaperlessError::MissingTitle);
        }
        let document = self.with_defaults(document);
        let tag_ids = self.resolve_tags(&document.tags).await?;
        let title = document.title.clone();
        let bytes = document.data.len();

        let response = self
            .http
            .post(self.url(POST_DOCUMENT_PATH))
            .multipart(upload_form(document, &tag_ids)?)
            .send()
            .await
            .map_err(|e| PaperlessError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaperlessError::Status {
                operation: "upload document",
                status: status.as_u16(),
                body,
            });
        }
        debug!(%title, bytes, tags = tag_ids.len(), "Uploaded document to Paperless");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<TagRecord> {
        vec![
            TagRecord { id: 0, name: "ghost".into() },
            TagRecord { id: 3, name: "Invoice".into() },
            TagRecord { id: 7, name: "acme".into() },
        ]
    }

    #[test]
    fn test_find_tag_id_case_insensitive() {
        assert_eq!(find_tag_id(&tags(), "invoice"), Some(3));
        assert_eq!(find_tag_id(&tags(), "ACME"), Some(7));
        assert_eq!(find_tag_id(&tags(), "tax"), None);
    }

    #[test]
    fn test_find_tag_id_skips_id_zero() {
        assert_eq!(find_tag_id(&tags(), "ghost"), None);
    }

    #[test]
    fn test_tag_page_decoding() {
        let body = r#"{"count":2,"next":"http://p/api/tags/?page=2","previous":null,
                      "results":[{"id":1,"name":"a","colour":1},{"id":2,"name":"b"}]}"#;
        let page: TagPage = serde_json::from_str(body).unwrap();
        assert!(page.next.is_some());
        assert_eq!(page.results.len(), 2);

        let last: TagPage = serde_json::from_str(r#"{"next":null,"results":[]}"#).unwrap();
        assert!(last.next.is_none());
    }

    #[test]
    fn test_defaults_fill_unset_fields_only() {
        let client = PaperlessClient::new(&PaperlessConfig {
            url: "http://paperless:8000/".into(),
            token: "t".into(),
            correspondent: Some(1),
            document_type: Some(2),
            storage_path: None,
        })
        .unwrap();
        assert_eq!(client.url(TAGS_PATH), "http://paperless:8000/api/tags/");

        let doc = client.with_defaults(Document {
            title: "x.pdf".into(),
            document_type: Some(9),
            ..Document::default()
        });
        assert_eq!(doc.correspondent, Some(1));
        assert_eq!(doc.document_type, Some(9));
        assert_eq!(doc.storage_path, None);
    }

    #[tokio::test]
    async fn test_upload_requires_title() {
        let client = PaperlessClient::new(&PaperlessConfig::default()).unwrap();
        let err = client.upload(Document::default()).await.unwrap_err();
        assert!(matches!(err, PaperlessError::MissingTitle));
    }
}
