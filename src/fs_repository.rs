//! A document repository laid out as plain files.
//!
//! ```text
//! <root>/<project>/source/<name>.txt|md          source documents
//! <root>/<project>/annotation/<user>/<name>.json  one user's CAS for <name>
//! ```
//!
//! Every user with an annotation directory has access to the project.
//! Projects and documents are identified by hashing their names, so ids
//! stay the same across runs.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{
    cas::{self, Cas},
    error::{Error, Result},
    ids::StableId,
    model::{AnnotationDocument, IndexedDocument, Project, ProjectId, SourceDocument},
    repository::DocumentRepository,
    walker,
};

const SOURCE_DIR: &str = "source";
const ANNOTATION_DIR: &str = "annotation";
const SOURCE_EXTENSIONS: &[&str] = &["txt", "md"];
const ANNOTATION_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every project directory under the root, sorted by name.
    pub fn projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = subdirectories(&self.root)?
            .into_iter()
            .map(|name| Project::new(StableId::project(&name).numeric, name))
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    pub fn project(&self, name: &str) -> Result<Project> {
        if !self.root.join(name).is_dir() {
            return Err(Error::NotFound {
                kind: "project",
                name: name.to_string(),
            });
        }
        Ok(Project::new(StableId::project(name).numeric, name))
    }

    fn project_name(&self, id: ProjectId) -> Result<String> {
        self.projects()?
            .into_iter()
            .find(|project| project.id == id)
            .map(|project| project.name)
            .ok_or_else(|| Error::NotFound {
                kind: "project",
                name: id.to_string(),
            })
    }

    fn source_document(&self, project: &Project, name: &str) -> SourceDocument {
        let id = StableId::source(&project.name, name).numeric;
        SourceDocument::new(id, project.id, name)
    }

    fn annotation_path(&self, project: &str, user: &str, source: &str) -> PathBuf {
        self.root
            .join(project)
            .join(ANNOTATION_DIR)
            .join(user)
            .join(format!("{source}.{ANNOTATION_EXTENSION}"))
    }

    fn resolve(&self, id: ProjectId) -> Result<Project> {
        let name = self.project_name(id)?;
        Ok(Project { id, name })
    }
}

impl DocumentRepository for FsRepository {
    fn users_with_permissions(&self, project: ProjectId) -> Result<Vec<String>> {
        let project = self.resolve(project)?;
        let mut users =
            subdirectories(&self.root.join(&project.name).join(ANNOTATION_DIR))?;
        users.sort();
        Ok(users)
    }

    fn source_documents(&self, project: ProjectId) -> Result<Vec<SourceDocument>> {
        let project = self.resolve(project)?;
        let dir = self.root.join(&project.name).join(SOURCE_DIR);
        Ok(walker::discover_files(&dir, SOURCE_EXTENSIONS)?
            .into_iter()
            .map(|file| {
                let name = file.relative_path.to_string_lossy().to_string();
                self.source_document(&project, &name)
            })
            .collect())
    }

    fn annotation_documents(
        &self,
        project: ProjectId,
        user: &str,
    ) -> Result<Vec<AnnotationDocument>> {
        let project = self.resolve(project)?;
        let project_dir = self.root.join(&project.name);
        let dir = project_dir.join(ANNOTATION_DIR).join(user);

        let mut documents = Vec::new();
        for file in walker::discover_files(&dir, &[ANNOTATION_EXTENSION])? {
            let file_name = file.relative_path.to_string_lossy().to_string();
            let Some(name) = file_name
                .strip_suffix(ANNOTATION_EXTENSION)
                .and_then(|n| n.strip_suffix('.'))
            else {
                continue;
            };
            if !project_dir.join(SOURCE_DIR).join(name).is_file() {
                warn!(
                    project = %project.name,
                    user,
                    file = %file_name,
                    "annotation has no source document, skipping"
                );
                continue;
            }
            let source = self.source_document(&project, name);
            let id = StableId::annotation(source.id, user).numeric;
            documents.push(AnnotationDocument::new(id, &source, user));
        }
        Ok(documents)
    }

    fn annotation_documents_for(
        &self,
        source: &SourceDocument,
    ) -> Result<Vec<AnnotationDocument>> {
        let project = self.resolve(source.project)?;
        Ok(self
            .users_with_permissions(source.project)?
            .into_iter()
            .filter(|user| {
                self.annotation_path(&project.name, user, &source.name).is_file()
            })
            .map(|user| {
                let id = StableId::annotation(source.id, &user).numeric;
                AnnotationDocument::new(id, source, user)
            })
            .collect())
    }

    fn read_cas(&self, document: &IndexedDocument) -> Result<Cas> {
        let project = self.resolve(document.project())?;
        match document {
            IndexedDocument::Source(doc) => {
                let path =
                    self.root.join(&project.name).join(SOURCE_DIR).join(&doc.name);
                Ok(Cas::new(std::fs::read_to_string(path)?))
            }
            IndexedDocument::Annotation(doc) => {
                let path = self.annotation_path(&project.name, &doc.user, &doc.name);
                cas::from_bytes(&std::fs::read(path)?)
            }
        }
    }
}

/// Names of the non-hidden directories directly under `dir`.
fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') && entry.file_type()?.is_dir() {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::Annotation;

    fn workspace() -> (tempfile::TempDir, FsRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("corpus");
        std::fs::create_dir_all(project.join("source")).unwrap();
        std::fs::write(project.join("source/story.txt"), "the cat sat").unwrap();
        std::fs::write(project.join("source/notes.md"), "a dog ran").unwrap();

        let alice = project.join("annotation/alice");
        std::fs::create_dir_all(&alice).unwrap();
        let cas = Cas::new("the cat sat")
            .with_annotation(Annotation::new("pos", 4, 7).with_feature("value", "NOUN"));
        std::fs::write(alice.join("story.txt.json"), cas::to_bytes(&cas).unwrap())
            .unwrap();
        std::fs::write(alice.join("orphan.txt.json"), b"{\"text\":\"\"}").unwrap();
        std::fs::create_dir_all(project.join("annotation/bob")).unwrap();

        let repo = FsRepository::new(tmp.path());
        (tmp, repo)
    }

    #[test]
    fn lists_projects_with_stable_ids() {
        let (_tmp, repo) = workspace();
        let projects = repo.projects().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "corpus");
        assert_eq!(repo.project("corpus").unwrap(), projects[0]);
        assert!(matches!(repo.project("missing"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn reads_sources_and_annotations() {
        let (_tmp, repo) = workspace();
        let project = repo.project("corpus").unwrap();

        let sources = repo.source_documents(project.id).unwrap();
        let names: Vec<_> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["notes.md", "story.txt"]);

        assert_eq!(
            repo.users_with_permissions(project.id).unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );

        let annotations = repo.annotation_documents(project.id, "alice").unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].name, "story.txt");
        assert_eq!(annotations[0].source_id, sources[1].id);

        let cas = repo.read_cas(&annotations[0].clone().into()).unwrap();
        assert_eq!(cas.layers(), vec!["pos"]);
        let text = repo.read_cas(&sources[0].clone().into()).unwrap();
        assert_eq!(text.text, "a dog ran");
    }

    #[test]
    fn annotations_for_source() {
        let (_tmp, repo) = workspace();
        let project = repo.project("corpus").unwrap();
        let sources = repo.source_documents(project.id).unwrap();

        let story = &sources[1];
        let annotations = repo.annotation_documents_for(story).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].user, "alice");
        assert!(repo.annotation_documents_for(&sources[0]).unwrap().is_empty());
    }
}
