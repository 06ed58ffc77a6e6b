//! Registry access.
//!
//! [`Registry`] is the seam the pipeline talks through; [`HttpRegistry`]
//! implements it against the docker distribution API (manifests, tag lists)
//! and the registry's application API (repository and tag detail records).
//! Bearer-token negotiation and retry policy are out of scope here: requests
//! carry optional basic credentials and transport errors propagate to the
//! caller.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LINK};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::reference::ContainerParts;

pub const MANIFEST_LIST_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MANIFEST_V2S2_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MANIFEST_V2S1_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MANIFEST_OCI_LIST_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const MANIFEST_OCI_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Accept-header order tried when the caller doesn't request a specific
/// manifest type.  If none of these matches the served Content-Type, the
/// last response body is accepted as-is.
pub const MANIFEST_TYPE_PREFERENCE: [&str; 5] = [
    MANIFEST_LIST_TYPE,
    MANIFEST_V2S2_TYPE,
    MANIFEST_OCI_LIST_TYPE,
    MANIFEST_OCI_TYPE,
    MANIFEST_V2S1_TYPE,
];

/// A repository record from the application API.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RepoInfo {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl RepoInfo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A tag record from the application API, including the last-modified
/// timestamp the docker API's plain tag list doesn't carry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    #[serde(default)]
    pub manifest_digest: Option<String>,
    #[serde(default)]
    pub is_manifest_list: bool,
    #[serde(default)]
    pub size: Option<u64>,
    /// RFC 2822 timestamp, e.g. `Wed, 25 Jan 2023 17:23:59 -0000`.
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub reversion: bool,
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub expiration: Option<String>,
}

/// Access to container image manifests and repository metadata.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the raw manifest body for `image` (a full
    /// `registry/image:tag` or `registry/image@digest` reference).
    ///
    /// With `media_type` given, the registry must serve exactly that type
    /// (`ManifestType` otherwise).  Without one, [`MANIFEST_TYPE_PREFERENCE`]
    /// is tried in order and the last response is accepted if nothing
    /// matches.  A missing manifest is `ManifestNotFound`.
    async fn manifest(&self, image: &str, media_type: Option<&str>) -> Result<String>;

    /// Tag names of a repository (`namespace/name`) via the docker API.
    async fn tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Repositories of a namespace via the application API.
    async fn repositories(&self, namespace: &str) -> Result<Vec<RepoInfo>>;

    /// Detailed tag records of a repository via the application API.
    async fn tag_details(&self, repository: &str) -> Result<Vec<TagInfo>>;

    /// Digest of the manifest served for `image`, computed locally over the
    /// fetched body rather than taken from any response header.
    async fn manifest_digest(&self, image: &str) -> Result<String> {
        let body = self.manifest(image, None).await?;
        Ok(crate::resolve::hash(body.as_bytes()))
    }
}

/// Registry client over HTTP.
///
/// Manifest fetches address the registry named inside the image reference;
/// repository-level calls go to the configured `host`.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    host: String,
    auth: Option<(String, String)>,
}

impl HttpRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            host: host.into(),
            auth: None,
        }
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    async fn get(&self, url: &str, accept: Option<&str>) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(media_type) = accept {
            request = request.header(ACCEPT, media_type);
        }
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        Ok(request.send().await?)
    }

    async fn get_manifest_response(
        &self,
        url: &str,
        image: &str,
        accept: &str,
    ) -> Result<Response> {
        let response = self.get(url, Some(accept)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::ManifestNotFound(image.to_string()));
        }
        response.error_for_status_ref()?;
        Ok(response)
    }
}

fn manifest_url(image: &str) -> Result<String> {
    let parts = ContainerParts::parse(image)?;
    let reference = match (&parts.tag, parts.manifests.first()) {
        (Some(tag), _) => tag.clone(),
        (None, Some(first)) => first.digest.clone(),
        (None, None) => return Err(PipelineError::MalformedReference(image.to_string())),
    };
    Ok(format!(
        "https://{}/v2/{}/manifests/{}",
        parts.registry, parts.image, reference
    ))
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Extract the `rel="next"` target from a docker API Link header.
fn next_page_url(link: &str) -> Result<String> {
    for part in link.split(',') {
        let part = part.trim();
        if !part.contains(r#"rel="next""#) {
            continue;
        }
        let start = part.find('<');
        let end = part.find('>');
        if let (Some(start), Some(end)) = (start, end) {
            if start < end {
                return Ok(part[start + 1..end].to_string());
            }
        }
    }
    Err(PipelineError::Protocol(format!(
        "could not extract next page URL from Link header {link:?}"
    )))
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoriesPage {
    #[serde(default)]
    repositories: Vec<RepoInfo>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagDetailsPage {
    #[serde(default)]
    tags: Vec<TagInfo>,
    #[serde(default)]
    has_additional: bool,
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn manifest(&self, image: &str, media_type: Option<&str>) -> Result<String> {
        let url = manifest_url(image)?;

        if let Some(requested) = media_type {
            let response = self.get_manifest_response(&url, image, requested).await?;
            let served = content_type(&response);
            // a CDN may serve V2S1 manifests as text/plain
            if served != requested && !served.contains("text/plain") {
                return Err(PipelineError::ManifestType {
                    reference: image.to_string(),
                    media_type: requested.to_string(),
                });
            }
            return Ok(response.text().await?);
        }

        let mut body = String::new();
        for candidate in MANIFEST_TYPE_PREFERENCE {
            let response = self.get_manifest_response(&url, image, candidate).await?;
            let served = content_type(&response);
            body = response.text().await?;
            if served == candidate {
                break;
            }
        }
        Ok(body)
    }

    async fn tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut url = format!("https://{}/v2/{}/tags/list", self.host, repository);
        let mut tags = Vec::new();
        loop {
            let response = self.get(&url, None).await?;
            response.error_for_status_ref()?;
            let link = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let page: TagsPage = response.json().await?;
            tags.extend(page.tags);
            match link {
                Some(link) => {
                    let next = next_page_url(&link)?;
                    url = if next.starts_with("http") {
                        next
                    } else {
                        format!("https://{}{}", self.host, next)
                    };
                }
                None => break,
            }
        }
        Ok(tags)
    }

    async fn repositories(&self, namespace: &str) -> Result<Vec<RepoInfo>> {
        let mut next_page = String::new();
        let mut repositories = Vec::new();
        loop {
            let url = format!(
                "https://{}/api/v1/repository?namespace={}&next_page={}",
                self.host, namespace, next_page
            );
            let response = self.get(&url, None).await?;
            response.error_for_status_ref()?;
            let page: RepositoriesPage = response.json().await?;
            repositories.extend(page.repositories);
            match page.next_page {
                Some(token) if !token.is_empty() => next_page = token,
                _ => break,
            }
        }
        Ok(repositories)
    }

    async fn tag_details(&self, repository: &str) -> Result<Vec<TagInfo>> {
        let mut page = 1;
        let mut tags = Vec::new();
        loop {
            let url = format!(
                "https://{}/api/v1/repository/{}/tag/?page={}&onlyActiveTags=true",
                self.host, repository, page
            );
            let response = self.get(&url, None).await?;
            response.error_for_status_ref()?;
            let details: TagDetailsPage = response.json().await?;
            tags.extend(details.tags);
            if !details.has_additional {
                break;
            }
            page += 1;
        }
        Ok(tags)
    }
}
