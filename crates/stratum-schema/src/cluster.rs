//! The Clusterfile: the YAML cluster-configuration document embedded in every
//! image as an annotation.
//!
//! Only `spec.image` is interpreted here. Every other field is carried through
//! untouched so a rewrite never loses configuration it does not understand.
//! A Clusterfile may be a multi-document stream (`Cluster` followed by
//! `Config` or `Plugin` documents); only the `Cluster` document is rewritten.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterfileError {
    #[error("invalid clusterfile: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("clusterfile kind must be 'Cluster', found '{0}'")]
    WrongKind(String),
    #[error("clusterfile is empty")]
    Empty,
}

const CLUSTER_KIND: &str = "Cluster";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDocument {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    #[serde(default)]
    pub image: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ClusterDocument {
    /// Parse the `Cluster` document out of a Clusterfile.
    pub fn parse(input: &str) -> Result<Self, ClusterfileError> {
        let docs = parse_documents(input)?;
        let index = cluster_index(&docs)?;
        Ok(serde_yaml::from_value(docs[index].clone())?)
    }

    pub fn to_yaml(&self) -> Result<String, ClusterfileError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Split a YAML stream into its documents, dropping empty ones.
fn parse_documents(input: &str) -> Result<Vec<Value>, ClusterfileError> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// The first document of kind `Cluster`. A lone document without a kind is
/// taken as the cluster.
fn cluster_index(docs: &[Value]) -> Result<usize, ClusterfileError> {
    let kind_of = |doc: &Value| doc.get("kind").and_then(Value::as_str).map(str::to_owned);
    if let Some(index) = docs
        .iter()
        .position(|d| kind_of(d).as_deref() == Some(CLUSTER_KIND))
    {
        return Ok(index);
    }
    let first = docs.first().ok_or(ClusterfileError::Empty)?;
    match kind_of(first) {
        Some(kind) if !kind.is_empty() => Err(ClusterfileError::WrongKind(kind)),
        _ => Ok(0),
    }
}

/// Point a raw Clusterfile at `image_name` and re-serialize it. Documents
/// other than the `Cluster` one are re-emitted unchanged and in order.
pub fn rewrite_clusterfile_image(raw: &str, image_name: &str) -> Result<String, ClusterfileError> {
    let mut docs = parse_documents(raw)?;
    let index = cluster_index(&docs)?;
    let mut cluster: ClusterDocument = serde_yaml::from_value(docs[index].clone())?;
    cluster.spec.image = image_name.to_owned();
    docs[index] = serde_yaml::to_value(&cluster)?;

    let rendered = docs
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rendered.join("---\n"))
}
