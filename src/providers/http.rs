use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::adapter::{FetchedObject, ObjectIter, RemoteAdapter};
use crate::digest::ContentDigest;
use crate::domain::{ContainerRef, ObjectId, RemoteObject};
use crate::error::IngestError;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bucket: Option<NaiveDate>,
}

impl ManifestEntry {
    fn into_object(self) -> Result<RemoteObject, IngestError> {
        let digest = match (&self.sha256, &self.sha1) {
            (Some(hex), _) => Some(ContentDigest::sha256(hex)?),
            (None, Some(hex)) => Some(ContentDigest::sha1(hex)?),
            (None, None) => None,
        };
        Ok(RemoteObject {
            id: ObjectId::new(self.id),
            name: self.name,
            digest,
            size: self.size,
            modified: self.modified,
            bucket: self.bucket,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    objects: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct HttpManifestConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Environment variable holding a bearer token, if the source needs one.
    pub token_env: Option<String>,
    pub allow_delete: bool,
}

/// Source that publishes one JSON manifest per container:
/// `GET <base>/<prefix>/manifest.json` returning `{"objects": [...]}`.
/// Object URLs in the manifest may be absolute or relative to the base.
pub struct HttpManifestAdapter {
    name: String,
    base_url: String,
    allow_delete: bool,
    client: Client,
    /// Download URLs seen in the last manifests, keyed by object id.
    urls: Mutex<HashMap<ObjectId, String>>,
}

impl HttpManifestAdapter {
    pub fn new(name: impl Into<String>, config: HttpManifestConfig) -> Result<Self, IngestError> {
        let name = name.into();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("mirror-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::ConfigInvalid(err.to_string()))?,
        );
        if let Some(var) = &config.token_env {
            let token = std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| IngestError::Credential {
                    source_name: name.clone(),
                    message: format!("environment variable {var} is not set"),
                })?;
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| IngestError::Credential {
                    source_name: name.clone(),
                    message: err.to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| IngestError::remote(&name, err.to_string()))?;
        Ok(Self {
            name,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            allow_delete: config.allow_delete,
            client,
            urls: Mutex::new(HashMap::new()),
        })
    }

    pub fn manifest_url(&self, container: &ContainerRef) -> String {
        format!("{}/{}/{MANIFEST_FILE}", self.base_url, container.prefix)
    }

    fn object_url(&self, id: &ObjectId) -> String {
        format!("{}/objects/{}", self.base_url, id.as_str())
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IngestError> {
        request
            .send()
            .map_err(|err| IngestError::remote(&self.name, err.to_string()))
    }

    fn handle_status(&self, response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "request failed".to_string());
        Err(IngestError::RemoteStatus {
            source_name: self.name.clone(),
            status,
            message,
        })
    }
}

impl RemoteAdapter for HttpManifestAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, container: &ContainerRef) -> Result<ObjectIter<'a>, IngestError> {
        let url = self.manifest_url(container);
        let response = self.send(self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(source = %self.name, %url, "no manifest for container");
            return Ok(Box::new(std::iter::empty()));
        }
        let manifest: Manifest = self
            .handle_status(response)?
            .json()
            .map_err(|err| IngestError::remote(&self.name, format!("manifest {url}: {err}")))?;
        if let Ok(mut urls) = self.urls.lock() {
            for entry in &manifest.objects {
                urls.insert(ObjectId::new(&entry.id), self.resolve_url(&entry.url));
            }
        }
        tracing::debug!(source = %self.name, %url, objects = manifest.objects.len(), "manifest loaded");
        Ok(Box::new(
            manifest.objects.into_iter().map(ManifestEntry::into_object),
        ))
    }

    fn fetch(&self, object: &RemoteObject) -> Result<FetchedObject, IngestError> {
        let known = self
            .urls
            .lock()
            .ok()
            .and_then(|urls| urls.get(&object.id).cloned());
        let (url, hint) = match known {
            Some(url) => (url, object.digest.clone()),
            None => {
                let entry = self.metadata_entry(&object.id)?.ok_or_else(|| {
                    IngestError::RemoteNotFound {
                        source_name: self.name.clone(),
                        id: object.id.to_string(),
                    }
                })?;
                let url = self.resolve_url(&entry.url);
                (url, entry.into_object()?.digest)
            }
        };
        let response = self.handle_status(self.send(self.client.get(&url))?)?;
        Ok(FetchedObject::new(response).with_digest_hint(hint))
    }

    fn metadata(&self, id: &ObjectId) -> Result<Option<RemoteObject>, IngestError> {
        self.metadata_entry(id)?
            .map(ManifestEntry::into_object)
            .transpose()
    }

    fn supports_delete(&self) -> bool {
        self.allow_delete
    }

    fn delete(&self, object: &RemoteObject) -> Result<(), IngestError> {
        if !self.allow_delete {
            return Err(IngestError::DeleteUnsupported(self.name.clone()));
        }
        let url = self.object_url(&object.id);
        let response = self
            .client
            .delete(&url)
            .send()
            .map_err(|err| IngestError::Deletion {
                source_name: self.name.clone(),
                id: object.id.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(IngestError::Deletion {
                source_name: self.name.clone(),
                id: object.id.to_string(),
                message: format!("status {}", response.status().as_u16()),
            });
        }
        Ok(())
    }
}

impl HttpManifestAdapter {
    fn metadata_entry(&self, id: &ObjectId) -> Result<Option<ManifestEntry>, IngestError> {
        let response = self.send(self.client.get(self.object_url(id)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry = self
            .handle_status(response)?
            .json()
            .map_err(|err| IngestError::remote(&self.name, err.to_string()))?;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{Datatype, SubjectId};

    fn config(token_env: Option<&str>) -> HttpManifestConfig {
        HttpManifestConfig {
            base_url: "https://data.example.org/export/".to_string(),
            timeout: Duration::from_secs(5),
            token_env: token_env.map(str::to_string),
            allow_delete: false,
        }
    }

    #[test]
    fn manifest_url_uses_container_prefix() {
        let adapter = HttpManifestAdapter::new("survey", config(None)).unwrap();
        let datatype: Datatype = "surveys".parse().unwrap();
        let subject: SubjectId = "SUBJ01".parse().unwrap();
        let container = ContainerRef::new("StudyA", &datatype, &subject);
        assert_eq!(
            adapter.manifest_url(&container),
            "https://data.example.org/export/StudyA/surveys/SUBJ01/manifest.json"
        );
        assert_eq!(
            adapter.resolve_url("/files/a.json"),
            "https://data.example.org/export/files/a.json"
        );
    }

    #[test]
    fn missing_token_is_credential_error() {
        let err = HttpManifestAdapter::new(
            "survey",
            config(Some("MIRROR_INGEST_TEST_TOKEN_THAT_IS_NOT_SET")),
        )
        .err()
        .unwrap();
        assert_matches!(err, IngestError::Credential { .. });
    }

    #[test]
    fn manifest_entry_prefers_sha256() {
        let entry: ManifestEntry = serde_json::from_str(
            r#"{
                "id": "obj-1",
                "name": "SUBJ01_activity_2024_01_02.json",
                "url": "files/obj-1",
                "sha1": "a9993e364706816aba3e25717850c26c9cd0d89d",
                "sha256": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "bucket": "2024-01-02"
            }"#,
        )
        .unwrap();
        let object = entry.into_object().unwrap();
        assert_eq!(
            object.digest.unwrap().to_string(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(object.bucket, NaiveDate::from_ymd_opt(2024, 1, 2));
    }
}
