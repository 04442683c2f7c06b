//! Annotated document content and its byte serialization.
//!
//! A [`Cas`] holds a document's text together with the span annotations
//! made on it. The index only ever sees the serialized bytes produced by
//! [`to_bytes`], which keeps the physical index independent of how the
//! repository stores documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A span annotation on some layer, with optional feature values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub layer: String,
    /// Byte offset into [`Cas::text`] where the span begins (inclusive).
    pub begin: usize,
    /// Byte offset where the span ends (exclusive).
    pub end: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,
}

impl Annotation {
    pub fn new(layer: impl Into<String>, begin: usize, end: usize) -> Self {
        Self {
            layer: layer.into(),
            begin,
            end,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    /// Whether this span overlaps the half-open byte range `[begin, end)`.
    pub fn overlaps(&self, begin: usize, end: usize) -> bool {
        self.begin < end && begin < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cas {
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Cas {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            annotations: Vec::new(),
        }
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Distinct layer names used by this document, sorted.
    pub fn layers(&self) -> Vec<&str> {
        let mut layers: Vec<&str> =
            self.annotations.iter().map(|a| a.layer.as_str()).collect();
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    /// Annotations on `layer` that overlap `[begin, end)`.
    pub fn covering<'a>(
        &'a self,
        layer: &'a str,
        begin: usize,
        end: usize,
    ) -> impl Iterator<Item = &'a Annotation> + 'a {
        self.annotations
            .iter()
            .filter(move |a| a.layer == layer && a.overlaps(begin, end))
    }
}

pub fn to_bytes(cas: &Cas) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(cas)?)
}

pub fn from_bytes(bytes: &[u8]) -> Result<Cas> {
    Ok(serde_json::from_slice(bytes)?)
}
