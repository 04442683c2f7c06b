//! annosearch - lifecycle management for per-project search indexes.
//!
//! Every project owns one full-text index over its source documents and
//! the annotators' copies of them. [`SearchService`] decides when an index
//! is written, rebuilt, queried or dropped; the indexes themselves come
//! from an [`IndexProvider`](physical::IndexProvider), by default one backed
//! by [Tantivy](https://github.com/quickwit-oss/tantivy).
//!
//! Queries never block on a rebuild. An index that is not ready yet answers
//! [`QueryOutcome::NotReady`] and schedules the rebuild.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use annosearch::{
//!     DataDir, IndexConfig, IndexDb, ManualScheduler, MemoryRepository,
//!     QueryOutcome, SearchService,
//! };
//! use annosearch::cas::Cas;
//! use annosearch::model::{ProjectId, SourceDocument};
//! use annosearch::physical::SearchQuery;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let db = Arc::new(IndexDb::open(&data_dir.index_db()).unwrap());
//! let config = IndexConfig::load(&db).unwrap();
//! let provider = config.build_provider(&data_dir).unwrap();
//!
//! let project = ProjectId(1);
//! let repository = Arc::new(MemoryRepository::new());
//! repository.add_source(
//!     SourceDocument::new(1, project, "story.txt"),
//!     Cas::new("the cat sat on the mat"),
//! );
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let service =
//!     SearchService::new(db, provider, scheduler.clone(), repository, &config);
//!
//! let query = SearchQuery::new("alice", "cat");
//! if let QueryOutcome::NotReady = service.query(project, &query).unwrap() {
//!     scheduler.run_pending(&service);
//! }
//! if let QueryOutcome::Ready(groups) = service.query(project, &query).unwrap() {
//!     for (title, hits) in &groups {
//!         println!("{title}: {} hits", hits.len());
//!     }
//! }
//! ```

pub mod cas;
pub mod config;
pub mod coordinator;
pub mod data_dir;
pub mod error;
pub mod events;
pub mod fs_repository;
pub mod handle;
pub mod ids;
pub mod index_db;
pub mod model;
pub mod physical;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod tantivy_index;
pub mod walker;

pub use config::{IndexConfig, ProviderKind};
pub use coordinator::{QueryOutcome, SearchService};
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use fs_repository::FsRepository;
pub use handle::IndexState;
pub use index_db::IndexDb;
pub use repository::MemoryRepository;
pub use scheduler::{BackgroundScheduler, ManualScheduler};
pub use tantivy_index::{TantivyIndex, TantivyProvider};
