//! Retrieval data sources attached to chat completion requests.
//!
//! A source is described once in configuration and validated at load time.
//! Its index in the catalog is the identifier the router answers with.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Request payload fragment sent as the single element of `data_sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum DataSource {
    AzureSearch(AzureSearchParameters),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureSearchParameters {
    pub endpoint: String,
    pub index_name: String,
    #[serde(flatten)]
    pub credential: SearchCredential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_configuration: Option<String>,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub fields_mapping: FieldsMapping,
    #[serde(default = "default_top_n_documents")]
    pub top_n_documents: u32,
    #[serde(default = "default_in_scope")]
    pub in_scope: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_information: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dependency: Option<EmbeddingDependency>,
}

fn default_top_n_documents() -> u32 {
    20
}

fn default_in_scope() -> bool {
    true
}

/// Either the structured `authentication` object or the legacy bare `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchCredential {
    Authentication { authentication: SearchAuthentication },
    Key { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchAuthentication {
    ApiKey { key: String },
    SystemAssignedManagedIdentity,
    UserAssignedManagedIdentity { managed_identity_resource_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Simple,
    Semantic,
    Vector,
    VectorSimpleHybrid,
    VectorSemanticHybrid,
}

impl QueryType {
    fn needs_embeddings(self) -> bool {
        matches!(
            self,
            QueryType::Vector | QueryType::VectorSimpleHybrid | QueryType::VectorSemanticHybrid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsMapping {
    #[serde(default = "default_separator")]
    pub content_fields_separator: String,
    #[serde(default = "default_content_fields")]
    pub content_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath_field: Option<String>,
    #[serde(default = "default_title_field", skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector_fields: Vec<String>,
}

fn default_separator() -> String {
    "\n".to_string()
}

fn default_content_fields() -> Vec<String> {
    vec!["content".to_string()]
}

fn default_title_field() -> Option<String> {
    Some("title".to_string())
}

impl Default for FieldsMapping {
    fn default() -> Self {
        Self {
            content_fields_separator: default_separator(),
            content_fields: default_content_fields(),
            filepath_field: None,
            title_field: default_title_field(),
            url_field: None,
            vector_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingDependency {
    DeploymentName { deployment_name: String },
    Endpoint { endpoint: String, authentication: EmbeddingAuthentication },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingAuthentication {
    ApiKey { key: String },
}

impl AzureSearchParameters {
    /// Parameters for an API-key protected index with the default mapping.
    pub fn with_key(endpoint: impl Into<String>, key: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            index_name: index_name.into(),
            credential: SearchCredential::Key { key: key.into() },
            semantic_configuration: None,
            query_type: QueryType::default(),
            fields_mapping: FieldsMapping::default(),
            top_n_documents: default_top_n_documents(),
            in_scope: default_in_scope(),
            role_information: None,
            embedding_dependency: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.endpoint).map_err(|e| format!("invalid endpoint '{}': {}", self.endpoint, e))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(format!("endpoint must be http(s), got '{}'", url.scheme()));
        }
        if self.index_name.trim().is_empty() {
            return Err("index_name cannot be empty".to_string());
        }
        if self.top_n_documents == 0 {
            return Err("top_n_documents must be at least 1".to_string());
        }
        match &self.credential {
            SearchCredential::Key { key }
            | SearchCredential::Authentication {
                authentication: SearchAuthentication::ApiKey { key },
            } if key.trim().is_empty() => {
                return Err("API key cannot be empty".to_string());
            }
            _ => {}
        }
        if self.query_type.needs_embeddings() && self.embedding_dependency.is_none() {
            return Err(format!(
                "query_type {:?} requires an embedding_dependency",
                self.query_type
            ));
        }
        if let Some(EmbeddingDependency::Endpoint { endpoint, .. }) = &self.embedding_dependency {
            Url::parse(endpoint).map_err(|e| format!("invalid embedding endpoint '{}': {}", endpoint, e))?;
        }
        Ok(())
    }
}

impl DataSource {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DataSource::AzureSearch(params) => params.validate(),
        }
    }

    /// Copy of this source with `role_information` filled in when absent.
    pub fn with_role_information(&self, prompt: &str) -> DataSource {
        match self {
            DataSource::AzureSearch(params) => {
                let mut params = params.clone();
                if params.role_information.is_none() {
                    params.role_information = Some(prompt.to_string());
                }
                DataSource::AzureSearch(params)
            }
        }
    }
}

/// A configured source: routing metadata plus its request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub source: DataSource,
}

/// Validated, immutable list of sources. Index position is the identifier.
#[derive(Debug, Clone)]
pub struct DataSourceCatalog {
    sources: Vec<DataSourceDescriptor>,
}

impl DataSourceCatalog {
    pub fn new(sources: Vec<DataSourceDescriptor>) -> Result<Self, ConfigError> {
        if sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one data source must be configured".to_string(),
            ));
        }
        for descriptor in &sources {
            if descriptor.name.trim().is_empty() {
                return Err(ConfigError::InvalidDataSource {
                    name: "<unnamed>".to_string(),
                    reason: "name cannot be empty".to_string(),
                });
            }
            descriptor
                .source
                .validate()
                .map_err(|reason| ConfigError::InvalidDataSource {
                    name: descriptor.name.clone(),
                    reason,
                })?;
        }
        Ok(Self { sources })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DataSourceDescriptor> {
        self.sources.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataSourceDescriptor> {
        self.sources.iter()
    }
}
