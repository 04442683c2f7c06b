//! Domain records the index lifecycle works with.
//!
//! These are deliberately thin: the authoritative copies live in whatever
//! [`DocumentRepository`](crate::repository::DocumentRepository) the
//! service is wired to.

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct ProjectId(pub u64);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant owning documents and exactly one search index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

impl Project {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: ProjectId(id),
            name: name.into(),
        }
    }
}

/// An original upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: u64,
    pub project: ProjectId,
    pub name: String,
}

impl SourceDocument {
    pub fn new(id: u64, project: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            project,
            name: name.into(),
        }
    }
}

/// A single annotator's copy of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationDocument {
    pub id: u64,
    pub project: ProjectId,
    pub source_id: u64,
    pub name: String,
    pub user: String,
}

impl AnnotationDocument {
    pub fn new(id: u64, source: &SourceDocument, user: impl Into<String>) -> Self {
        Self {
            id,
            project: source.project,
            source_id: source.id,
            name: source.name.clone(),
            user: user.into(),
        }
    }
}

/// Anything that can be written into a project's index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexedDocument {
    Source(SourceDocument),
    Annotation(AnnotationDocument),
}

impl IndexedDocument {
    pub fn project(&self) -> ProjectId {
        match self {
            Self::Source(doc) => doc.project,
            Self::Annotation(doc) => doc.project,
        }
    }

    /// Id of the source document this entry derives from.
    pub fn source_id(&self) -> u64 {
        match self {
            Self::Source(doc) => doc.id,
            Self::Annotation(doc) => doc.source_id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Source(doc) => &doc.name,
            Self::Annotation(doc) => &doc.name,
        }
    }

    /// Owning annotator, `None` for source documents.
    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Source(_) => None,
            Self::Annotation(doc) => Some(&doc.user),
        }
    }

    /// Key that uniquely identifies this entry within a project index.
    pub fn key(&self) -> String {
        match self {
            Self::Source(doc) => format!("src:{}", doc.id),
            Self::Annotation(doc) => format!("ann:{}", doc.id),
        }
    }
}

impl From<SourceDocument> for IndexedDocument {
    fn from(doc: SourceDocument) -> Self {
        Self::Source(doc)
    }
}

impl From<AnnotationDocument> for IndexedDocument {
    fn from(doc: AnnotationDocument) -> Self {
        Self::Annotation(doc)
    }
}

impl std::fmt::Display for IndexedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(doc) => write!(f, "{} [{}]", doc.name, doc.id),
            Self::Annotation(doc) => {
                write!(f, "{} [{}] ({})", doc.name, doc.id, doc.user)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_inherits_source_identity() {
        let source = SourceDocument::new(7, ProjectId(1), "story.txt");
        let ann = AnnotationDocument::new(70, &source, "alice");
        let doc = IndexedDocument::from(ann);

        assert_eq!(doc.source_id(), 7);
        assert_eq!(doc.project(), ProjectId(1));
        assert_eq!(doc.title(), "story.txt");
        assert_eq!(doc.user(), Some("alice"));
        assert_eq!(doc.key(), "ann:70");
    }

    #[test]
    fn source_and_annotation_keys_differ() {
        let source = SourceDocument::new(7, ProjectId(1), "story.txt");
        let ann = AnnotationDocument::new(7, &source, "alice");
        assert_ne!(
            IndexedDocument::from(source).key(),
            IndexedDocument::from(ann).key()
        );
    }
}
