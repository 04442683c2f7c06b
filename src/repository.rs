//! Where documents, permissions and CAS content come from.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::RwLock,
};

use crate::{
    cas::Cas,
    error::{Error, Result},
    model::{AnnotationDocument, IndexedDocument, ProjectId, SourceDocument},
};

/// Read access to a project's documents, as needed for rebuilding its index.
pub trait DocumentRepository: Send + Sync {
    /// Users allowed to annotate in the project.
    fn users_with_permissions(&self, project: ProjectId) -> Result<Vec<String>>;

    fn source_documents(&self, project: ProjectId) -> Result<Vec<SourceDocument>>;

    /// The user's annotation documents in the project.
    fn annotation_documents(
        &self,
        project: ProjectId,
        user: &str,
    ) -> Result<Vec<AnnotationDocument>>;

    /// Every annotation document derived from `source`, across users.
    fn annotation_documents_for(
        &self,
        source: &SourceDocument,
    ) -> Result<Vec<AnnotationDocument>>;

    fn read_cas(&self, document: &IndexedDocument) -> Result<Cas>;
}

#[derive(Default)]
struct Store {
    sources: BTreeMap<u64, (SourceDocument, Cas)>,
    annotations: BTreeMap<u64, (AnnotationDocument, Cas)>,
    permissions: HashMap<ProjectId, BTreeSet<String>>,
}

/// Thread-safe in-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, document: SourceDocument, cas: Cas) {
        self.write().sources.insert(document.id, (document, cas));
    }

    /// Store an annotation document. Its user is granted access to the
    /// project.
    pub fn add_annotation(&self, document: AnnotationDocument, cas: Cas) {
        let mut store = self.write();
        store
            .permissions
            .entry(document.project)
            .or_default()
            .insert(document.user.clone());
        store.annotations.insert(document.id, (document, cas));
    }

    pub fn grant(&self, project: ProjectId, user: impl Into<String>) {
        self.write()
            .permissions
            .entry(project)
            .or_default()
            .insert(user.into());
    }

    /// Remove a source document and every annotation document derived from
    /// it.
    pub fn remove_source(&self, id: u64) -> Option<SourceDocument> {
        let mut store = self.write();
        let (source, _) = store.sources.remove(&id)?;
        store.annotations.retain(|_, (ann, _)| ann.source_id != id);
        Some(source)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Store> {
        match self.store.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Store> {
        match self.store.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DocumentRepository for MemoryRepository {
    fn users_with_permissions(&self, project: ProjectId) -> Result<Vec<String>> {
        Ok(self
            .read()
            .permissions
            .get(&project)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn source_documents(&self, project: ProjectId) -> Result<Vec<SourceDocument>> {
        Ok(self
            .read()
            .sources
            .values()
            .filter(|(doc, _)| doc.project == project)
            .map(|(doc, _)| doc.clone())
            .collect())
    }

    fn annotation_documents(
        &self,
        project: ProjectId,
        user: &str,
    ) -> Result<Vec<AnnotationDocument>> {
        Ok(self
            .read()
            .annotations
            .values()
            .filter(|(doc, _)| doc.project == project && doc.user == user)
            .map(|(doc, _)| doc.clone())
            .collect())
    }

    fn annotation_documents_for(
        &self,
        source: &SourceDocument,
    ) -> Result<Vec<AnnotationDocument>> {
        Ok(self
            .read()
            .annotations
            .values()
            .filter(|(doc, _)| {
                doc.project == source.project && doc.source_id == source.id
            })
            .map(|(doc, _)| doc.clone())
            .collect())
    }

    fn read_cas(&self, document: &IndexedDocument) -> Result<Cas> {
        let store = self.read();
        let found = match document {
            IndexedDocument::Source(doc) => {
                store.sources.get(&doc.id).map(|(_, cas)| cas.clone())
            }
            IndexedDocument::Annotation(doc) => {
                store.annotations.get(&doc.id).map(|(_, cas)| cas.clone())
            }
        };
        found.ok_or_else(|| Error::NotFound {
            kind: "document",
            name: document.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryRepository, SourceDocument) {
        let repo = MemoryRepository::new();
        let source = SourceDocument::new(1, ProjectId(1), "a.txt");
        repo.add_source(source.clone(), Cas::new("the cat sat"));
        repo.add_source(
            SourceDocument::new(2, ProjectId(2), "b.txt"),
            Cas::new("elsewhere"),
        );
        repo.add_annotation(
            AnnotationDocument::new(10, &source, "alice"),
            Cas::new("the cat sat"),
        );
        (repo, source)
    }

    #[test]
    fn documents_are_scoped_to_project() {
        let (repo, _) = seeded();
        let sources = repo.source_documents(ProjectId(1)).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "a.txt");
        assert!(repo.annotation_documents(ProjectId(2), "alice").unwrap().is_empty());
    }

    #[test]
    fn annotating_grants_permission() {
        let (repo, _) = seeded();
        repo.grant(ProjectId(1), "bob");
        assert_eq!(
            repo.users_with_permissions(ProjectId(1)).unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert!(repo.users_with_permissions(ProjectId(3)).unwrap().is_empty());
    }

    #[test]
    fn removing_source_drops_its_annotations() {
        let (repo, source) = seeded();
        assert_eq!(repo.annotation_documents_for(&source).unwrap().len(), 1);

        assert_eq!(repo.remove_source(source.id), Some(source.clone()));
        assert!(repo.annotation_documents_for(&source).unwrap().is_empty());
        assert!(matches!(
            repo.read_cas(&source.into()),
            Err(Error::NotFound { .. })
        ));
    }
}
