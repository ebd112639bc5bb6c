//! Compose template sources

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, error};
use url::Url;

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::utils::is_safe_ref;

/// File names tried inside a template directory, in order
pub const TEMPLATE_FILES: [&str; 2] = ["docker-compose.yml", "docker-compose.yaml"];

/// Source of raw Compose templates
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Fetch the Compose source of a template
    async fn fetch_compose_source(&self, template_ref: &str) -> Result<String, DockyardError>;
}

fn check_ref(template_ref: &str) -> Result<(), DockyardError> {
    if is_safe_ref(template_ref) {
        Ok(())
    } else {
        Err(DockyardError::ValidationError(format!(
            "invalid template reference: '{}'",
            template_ref
        )))
    }
}

/// Templates stored as `<dir>/<template_ref>/docker-compose.yml`
#[derive(Debug, Clone)]
pub struct DirTemplateSource {
    root: Dir,
}

impl DirTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Dir::new(root),
        }
    }
}

#[async_trait]
impl TemplateSource for DirTemplateSource {
    async fn fetch_compose_source(&self, template_ref: &str) -> Result<String, DockyardError> {
        check_ref(template_ref)?;
        let dir = self.root.subdir(template_ref);
        for name in TEMPLATE_FILES {
            let file = dir.file(name);
            if file.exists().await {
                debug!("Loading template {} from {}", template_ref, file.path().display());
                return file.read_string().await;
            }
        }
        Err(DockyardError::NotFound(format!("template {}", template_ref)))
    }
}

/// Templates served as `GET <base_url>/<template_ref>/docker-compose.yml`
#[derive(Debug, Clone)]
pub struct HttpTemplateSource {
    client: Client,
    base_url: Url,
}

impl HttpTemplateSource {
    pub fn new(base_url: &str) -> Result<Self, DockyardError> {
        // a trailing slash keeps the last path segment on join
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| {
            DockyardError::ConfigError(format!("invalid template base URL '{}': {}", base_url, e))
        })?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, base_url })
    }

    fn template_url(&self, template_ref: &str) -> Result<Url, DockyardError> {
        self.base_url
            .join(&format!("{}/{}", template_ref, TEMPLATE_FILES[0]))
            .map_err(|e| DockyardError::ValidationError(e.to_string()))
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch_compose_source(&self, template_ref: &str) -> Result<String, DockyardError> {
        check_ref(template_ref)?;
        let url = self.template_url(template_ref)?;
        debug!("GET {}", url);

        let response = self.client.get(url.clone()).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.text().await?),
            StatusCode::NOT_FOUND => Err(DockyardError::NotFound(format!("template {}", template_ref))),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("Template fetch failed: {} - {}", status, body);
                Err(DockyardError::StorageFailure(format!(
                    "fetching {} returned {}",
                    url, status
                )))
            }
        }
    }
}

/// Fixed set of templates held in memory
#[derive(Debug, Default)]
pub struct StaticTemplateSource {
    templates: RwLock<BTreeMap<String, String>>,
}

impl StaticTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template_ref: &str, source: &str) -> Self {
        self.insert(template_ref, source);
        self
    }

    pub fn insert(&self, template_ref: &str, source: &str) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(template_ref.to_string(), source.to_string());
        }
    }
}

#[async_trait]
impl TemplateSource for StaticTemplateSource {
    async fn fetch_compose_source(&self, template_ref: &str) -> Result<String, DockyardError> {
        self.templates
            .read()
            .map_err(|_| DockyardError::Internal("template registry poisoned".to_string()))?
            .get(template_ref)
            .cloned()
            .ok_or_else(|| DockyardError::NotFound(format!("template {}", template_ref)))
    }
}
