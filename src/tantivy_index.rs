use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tantivy::{
    DocAddress,
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::DocSetCollector,
    doc,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};
use tracing::debug;

use crate::{
    cas::{self, Cas},
    config::IndexConfig,
    error::{Error, Result},
    model::{IndexedDocument, ProjectId},
    physical::{
        GroupedResults,
        IndexProvider,
        PhysicalIndex,
        SearchQuery,
        SearchResult,
    },
};

/// Field names used in the schema.
pub mod fields {
    pub const DOC_KEY: &str = "doc_key";
    pub const SOURCE_ID: &str = "source_id";
    pub const USER: &str = "user";
    pub const KIND: &str = "kind";
    pub const TITLE: &str = "title";
    pub const BODY: &str = "body";
    pub const LAYER: &str = "layer";
    pub const CAS: &str = "cas";
}

const KIND_SOURCE: &str = "source";
const KIND_ANNOTATION: &str = "annotation";
const ANALYZER: &str = "en_stem";

/// Group key used when a hit's covering annotation lacks the feature.
pub const NO_VALUE: &str = "<no value>";

/// Query words treated as operators rather than search terms.
const OPERATORS: &[&str] = &["AND", "OR", "NOT"];

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub doc_key: Field,
    pub source_id: Field,
    pub user: Field,
    pub kind: Field,
    pub title: Field,
    pub body: Field,
    pub layer: Field,
    pub cas: Field,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let doc_key = builder.add_text_field(fields::DOC_KEY, STRING | STORED);
    let source_id =
        builder.add_u64_field(fields::SOURCE_ID, INDEXED | STORED | FAST);
    let user = builder.add_text_field(fields::USER, STRING | STORED);
    let kind = builder.add_text_field(fields::KIND, STRING | STORED);
    let title = builder.add_text_field(fields::TITLE, STORED);

    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(ANALYZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let body = builder.add_text_field(fields::BODY, body_opts);

    let layer = builder.add_text_field(fields::LAYER, STRING);
    let cas = builder.add_text_field(fields::CAS, STORED);

    let schema = builder.build();
    let fields = SchemaFields {
        doc_key,
        source_id,
        user,
        kind,
        title,
        body,
        layer,
        cas,
    };

    (schema, fields)
}

fn build_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build()
}

fn register_tokenizers(index: &Index) {
    index.tokenizers().register(ANALYZER, build_analyzer());
}

/// A token of a stored document, as the body field analyzer sees it.
struct TokenSpan {
    term: String,
    from: usize,
    to: usize,
}

fn tokenize(text: &str) -> Vec<TokenSpan> {
    let mut analyzer = build_analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        let token = stream.token();
        tokens.push(TokenSpan {
            term: token.text.clone(),
            from: token.offset_from,
            to: token.offset_to,
        });
    }
    tokens
}

/// Normalize a query string into the set of terms it searches for.
fn query_terms(query: &str) -> BTreeSet<String> {
    let words: Vec<&str> = query
        .split_whitespace()
        .filter(|w| !OPERATORS.contains(w))
        .collect();
    tokenize(&words.join(" "))
        .into_iter()
        .map(|t| t.term)
        .collect()
}

enum Storage {
    Disk(PathBuf),
    Ram,
}

struct OpenIndex {
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SchemaFields,
}

impl OpenIndex {
    fn new(index: Index, memory_budget: usize) -> Result<Self> {
        register_tokenizers(&index);
        let (_, fields) = build_schema();
        let reader = index.reader()?;
        let writer = index.writer(memory_budget)?;
        Ok(Self {
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    fn writer(&self) -> MutexGuard<'_, IndexWriter> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }
}

/// One project's Tantivy index.
pub struct TantivyIndex {
    storage: Storage,
    memory_budget: usize,
    context_size: usize,
    slot: RwLock<Option<OpenIndex>>,
}

/// A matching document selected for hit extraction.
struct Candidate {
    source_id: u64,
    title: String,
    cas: Cas,
}

impl TantivyIndex {
    pub fn on_disk(dir: PathBuf, config: &IndexConfig) -> Self {
        Self::with_storage(Storage::Disk(dir), config)
    }

    pub fn in_ram(config: &IndexConfig) -> Self {
        Self::with_storage(Storage::Ram, config)
    }

    fn with_storage(storage: Storage, config: &IndexConfig) -> Self {
        Self {
            storage,
            memory_budget: config.writer_memory_budget,
            context_size: config.context_size,
            slot: RwLock::new(None),
        }
    }

    /// Number of documents currently searchable.
    pub fn num_docs(&self) -> Result<u64> {
        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;
        open.reader.reload()?;
        Ok(open.reader.searcher().num_docs())
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<OpenIndex>> {
        match self.slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<OpenIndex>> {
        match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn collect_candidates(
        &self,
        open: &OpenIndex,
        request: &SearchQuery,
        terms: &BTreeSet<String>,
    ) -> Result<Vec<Candidate>> {
        let f = open.fields;
        let searcher = open.reader.searcher();

        let term_clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| {
                let q: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(f.body, t),
                    IndexRecordOption::Basic,
                ));
                (Occur::Should, q)
            })
            .collect();

        // Visible entries: the user's annotation documents plus all source
        // documents. Sources shadowed by an annotation document are dropped
        // below.
        let visibility = BooleanQuery::new(vec![
            (
                Occur::Should,
                Box::new(TermQuery::new(
                    Term::from_field_text(f.user, &request.user),
                    IndexRecordOption::Basic,
                )) as Box<dyn Query>,
            ),
            (
                Occur::Should,
                Box::new(TermQuery::new(
                    Term::from_field_text(f.kind, KIND_SOURCE),
                    IndexRecordOption::Basic,
                )),
            ),
        ]);

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, Box::new(BooleanQuery::new(term_clauses))),
            (Occur::Must, Box::new(visibility)),
        ];
        if let Some(document) = request.document {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_u64(f.source_id, document),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if let Some(ref layer) = request.layer {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(f.layer, layer),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        let query = BooleanQuery::new(clauses);
        let addresses: Vec<DocAddress> =
            searcher.search(&query, &DocSetCollector)?.into_iter().collect();

        // Sources the user has an annotation document for, matching or not.
        let mut shadowed = HashSet::new();
        if !request.user.is_empty() {
            let own = TermQuery::new(
                Term::from_field_text(f.user, &request.user),
                IndexRecordOption::Basic,
            );
            for address in searcher.search(&own, &DocSetCollector)? {
                let doc: TantivyDocument = searcher.doc(address)?;
                shadowed.insert(extract_u64(&doc, f.source_id));
            }
        }

        // One entry per source document; the user's annotated copy wins.
        let mut by_source: HashMap<u64, (bool, TantivyDocument)> =
            HashMap::new();
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            let source_id = extract_u64(&doc, f.source_id);
            let annotated = extract_text(&doc, f.kind) == KIND_ANNOTATION;
            if !annotated && shadowed.contains(&source_id) {
                continue;
            }
            match by_source.get(&source_id) {
                Some((true, _)) => {}
                Some((false, _)) if !annotated => {}
                _ => {
                    by_source.insert(source_id, (annotated, doc));
                }
            }
        }

        let mut candidates = Vec::with_capacity(by_source.len());
        for (source_id, (_, doc)) in by_source {
            candidates.push(Candidate {
                source_id,
                title: extract_text(&doc, f.title),
                cas: cas::from_bytes(extract_text(&doc, f.cas).as_bytes())?,
            });
        }
        candidates
            .sort_by(|a, b| (&a.title, a.source_id).cmp(&(&b.title, b.source_id)));
        Ok(candidates)
    }

    /// All hits of `request`, in document then token order, with their
    /// group keys.
    fn collect_hits(
        &self,
        request: &SearchQuery,
    ) -> Result<Vec<(String, SearchResult)>> {
        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;

        let terms = query_terms(&request.query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for candidate in self.collect_candidates(open, request, &terms)? {
            let text = &candidate.cas.text;
            let tokens = tokenize(text);
            for (i, token) in tokens.iter().enumerate() {
                if !terms.contains(&token.term) {
                    continue;
                }

                let group = match request.layer.as_deref() {
                    Some(layer) => {
                        let Some(covering) = candidate
                            .cas
                            .covering(layer, token.from, token.to)
                            .next()
                        else {
                            continue;
                        };
                        match request.feature.as_deref() {
                            Some(feature) => covering
                                .features
                                .get(feature)
                                .cloned()
                                .unwrap_or_else(|| NO_VALUE.to_string()),
                            None => candidate.title.clone(),
                        }
                    }
                    None => candidate.title.clone(),
                };

                let left = &tokens[i.saturating_sub(self.context_size)..i];
                let right_end = (i + 1 + self.context_size).min(tokens.len());
                let right = &tokens[i + 1..right_end];

                hits.push((
                    group,
                    SearchResult {
                        token_start: i,
                        token_length: 1,
                        offset_start: char_offset(text, token.from),
                        offset_end: char_offset(text, token.to),
                        text: text[token.from..token.to].to_string(),
                        left_context: join_tokens(text, left),
                        right_context: join_tokens(text, right),
                        document_id: candidate.source_id,
                        document_title: candidate.title.clone(),
                    },
                ));
            }
        }

        Ok(hits)
    }
}

impl PhysicalIndex for TantivyIndex {
    fn is_created(&self) -> bool {
        if self.read_slot().is_some() {
            return true;
        }
        match &self.storage {
            Storage::Disk(dir) => dir.join("meta.json").exists(),
            Storage::Ram => false,
        }
    }

    fn is_open(&self) -> bool {
        self.read_slot().is_some()
    }

    fn create(&self) -> Result<()> {
        let mut slot = self.write_slot();
        // Release the writer lock before touching files.
        slot.take();

        let (schema, _) = build_schema();
        let index = match &self.storage {
            Storage::Disk(dir) => {
                if dir.exists() {
                    std::fs::remove_dir_all(dir)?;
                }
                std::fs::create_dir_all(dir)?;
                let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
                    .map_err(|e| {
                        tantivy::TantivyError::SystemError(e.to_string())
                    })?;
                Index::create(
                    mmap_dir,
                    schema,
                    tantivy::IndexSettings::default(),
                )?
            }
            Storage::Ram => Index::create_in_ram(schema),
        };

        *slot = Some(OpenIndex::new(index, self.memory_budget)?);
        debug!("created search index");
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let mut slot = self.write_slot();
        if slot.is_some() {
            return Ok(());
        }

        let dir = match &self.storage {
            Storage::Disk(dir) => dir,
            Storage::Ram => {
                return Err(Error::NotFound {
                    kind: "index",
                    name: "in-memory index".to_string(),
                });
            }
        };

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        if !Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            return Err(Error::NotFound {
                kind: "index",
                name: dir.display().to_string(),
            });
        }

        let index = Index::open(mmap_dir)?;
        *slot = Some(OpenIndex::new(index, self.memory_budget)?);
        debug!(path = %dir.display(), "opened search index");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.write_slot().take().is_some() {
            debug!("closed search index");
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;
        let mut writer = open.writer();
        writer.delete_all_documents()?;
        open.commit(&mut writer)
    }

    fn delete(&self) -> Result<()> {
        self.write_slot().take();
        if let Storage::Disk(dir) = &self.storage
            && dir.exists()
        {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn index_document(
        &self,
        document: &IndexedDocument,
        cas_bytes: &[u8],
    ) -> Result<()> {
        let cas = cas::from_bytes(cas_bytes)?;
        let stored = serde_json::to_string(&cas)?;

        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;
        let f = open.fields;

        let key = document.key();
        let kind = match document {
            IndexedDocument::Source(_) => KIND_SOURCE,
            IndexedDocument::Annotation(_) => KIND_ANNOTATION,
        };
        let mut entry = doc!(
            f.doc_key => key.as_str(),
            f.source_id => document.source_id(),
            f.user => document.user().unwrap_or(""),
            f.kind => kind,
            f.title => document.title(),
            f.body => cas.text.as_str(),
            f.cas => stored,
        );
        for layer in cas.layers() {
            entry.add_text(f.layer, layer);
        }

        let mut writer = open.writer();
        writer.delete_term(Term::from_field_text(f.doc_key, &key));
        writer.add_document(entry)?;
        open.commit(&mut writer)
    }

    fn deindex_document(&self, document: &IndexedDocument) -> Result<()> {
        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;
        let f = open.fields;

        let mut writer = open.writer();
        writer.delete_term(Term::from_field_text(f.doc_key, &document.key()));
        open.commit(&mut writer)
    }

    fn deindex_source(&self, source: u64) -> Result<()> {
        let slot = self.read_slot();
        let open = slot.as_ref().ok_or(Error::IndexClosed)?;

        let mut writer = open.writer();
        writer.delete_term(Term::from_field_u64(open.fields.source_id, source));
        open.commit(&mut writer)
    }

    fn execute_query(&self, request: &SearchQuery) -> Result<GroupedResults> {
        let mut grouped = GroupedResults::new();
        for (group, hit) in self
            .collect_hits(request)?
            .into_iter()
            .skip(request.offset)
            .take(request.count)
        {
            grouped.entry(group).or_default().push(hit);
        }
        Ok(grouped)
    }

    fn number_of_query_results(&self, request: &SearchQuery) -> Result<u64> {
        Ok(self.collect_hits(request)?.len() as u64)
    }
}

impl std::fmt::Debug for TantivyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyIndex").finish_non_exhaustive()
    }
}

/// Hands out one [`TantivyIndex`] per project.
#[derive(Debug, Clone)]
pub struct TantivyProvider {
    root: Option<PathBuf>,
    config: IndexConfig,
}

impl TantivyProvider {
    pub const ID: &'static str = "tantivy";

    /// Store each project's index under `<root>/<project id>`.
    pub fn on_disk(root: PathBuf, config: &IndexConfig) -> Self {
        Self {
            root: Some(root),
            config: config.clone(),
        }
    }

    /// Keep indexes in memory only.
    pub fn in_ram(config: &IndexConfig) -> Self {
        Self {
            root: None,
            config: config.clone(),
        }
    }
}

impl IndexProvider for TantivyProvider {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn acquire(&self, project: ProjectId) -> Result<Arc<dyn PhysicalIndex>> {
        let index = match &self.root {
            Some(root) => TantivyIndex::on_disk(
                root.join(project.to_string()),
                &self.config,
            ),
            None => TantivyIndex::in_ram(&self.config),
        };
        Ok(Arc::new(index))
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn char_offset(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

fn join_tokens(text: &str, tokens: &[TokenSpan]) -> String {
    tokens
        .iter()
        .map(|t| &text[t.from..t.to])
        .collect::<Vec<_>>()
        .join(" ")
}
