use crate::types::{ImageId, LayerId};
use crate::{SchemaError, CLUSTERFILE_ANNOTATION, SCRATCH_IMAGE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of change a layer represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum LayerType {
    /// The FROM directive: names the parent image (or `scratch`).
    Base,
    Copy,
    Run,
    Cmd,
    /// Synthetic layer holding registry storage captured after the build ran.
    RegistrySnapshot,
}

impl LayerType {
    /// RUN and CMD both execute against the accumulated filesystem view.
    pub fn is_command(self) -> bool {
        matches!(self, LayerType::Run | LayerType::Cmd)
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerType::Base => write!(f, "FROM"),
            LayerType::Copy => write!(f, "COPY"),
            LayerType::Run => write!(f, "RUN"),
            LayerType::Cmd => write!(f, "CMD"),
            LayerType::RegistrySnapshot => write!(f, "REGISTRY-SNAPSHOT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    pub value: String,
    /// Content digest. Empty until realized, and left empty for RUN/CMD
    /// layers skipped by a lite build.
    #[serde(default)]
    pub id: LayerId,
}

impl Layer {
    pub fn new(layer_type: LayerType, value: impl Into<String>) -> Self {
        Self {
            layer_type,
            value: value.into(),
            id: LayerId::default(),
        }
    }

    pub fn is_realized(&self) -> bool {
        !self.id.is_empty()
    }

    /// For COPY layers: the source and destination operands. `dst` defaults to `.`.
    pub fn copy_operands(&self) -> Option<(&str, &str)> {
        if self.layer_type != LayerType::Copy {
            return None;
        }
        let mut fields = self.value.split_whitespace();
        let src = fields.next()?;
        let dst = fields.next().unwrap_or(".");
        Some((src, dst))
    }
}

/// A cluster image document.
///
/// Layers are ordered: each one is applied on top of all earlier ones.
/// `annotations` is a `BTreeMap` so serialization is canonical.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(default)]
    pub id: ImageId,
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Image {
    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self {
            id: ImageId::default(),
            layers,
            annotations: BTreeMap::new(),
        }
    }

    /// The FROM layer, if the document still starts with one.
    pub fn base(&self) -> Option<&Layer> {
        self.layers
            .first()
            .filter(|l| l.layer_type == LayerType::Base)
    }

    /// Name of the parent image, or `None` if the document has no FROM layer.
    pub fn base_name(&self) -> Option<&str> {
        self.base().map(|l| l.value.trim())
    }

    pub fn is_scratch(&self) -> bool {
        self.base_name() == Some(SCRATCH_IMAGE)
    }

    /// True when nothing after the FROM layer executes a command.
    pub fn is_only_copy(&self) -> bool {
        self.layers
            .iter()
            .skip(1)
            .all(|l| !l.layer_type.is_command())
    }

    pub fn clusterfile(&self) -> Option<&str> {
        self.annotations
            .get(CLUSTERFILE_ANNOTATION)
            .map(String::as_str)
    }

    pub fn set_clusterfile(&mut self, content: String) {
        self.annotations
            .insert(CLUSTERFILE_ANNOTATION.to_owned(), content);
    }

    /// Canonical bytes the image id is computed over: the document with its
    /// own id cleared, serialized as compact JSON.
    pub fn canonical_json(&self) -> Result<Vec<u8>, SchemaError> {
        let mut normalized = self.clone();
        normalized.id = ImageId::default();
        Ok(serde_json::to_vec(&normalized)?)
    }

    /// Content digest of the normalized document. Order-sensitive, and
    /// independent of whatever `id` is currently set.
    pub fn compute_id(&self) -> Result<ImageId, SchemaError> {
        let bytes = self.canonical_json()?;
        Ok(ImageId::new(blake3::hash(&bytes).to_hex().to_string()))
    }
}
