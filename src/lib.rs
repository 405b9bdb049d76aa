//! # Content Finder
//!
//! Hybrid retrieval over dashboard, workbook and datasource metadata.
//!
//! Raw metadata records are normalized into typed objects, embedded, and
//! stored in SQLite with an FTS5 index. Queries run a lexical and a
//! semantic path concurrently, fuse the two rankings, and hand the top
//! results to an answer generator inside a bounded conversation.
//!
//! ## Architecture
//!
//! ```text
//! records ─▶ normalize ─▶ embedding ─▶ store (objects + FTS5 + vectors)
//!                                            │
//!         query ─▶ conversation ─▶ planner ──┤ lexical ┐
//!                        ▲                   └ semantic┴▶ fusion ─▶ generator
//!                        └──────────── answer + history ◀──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! finder init
//! finder ingest ./records.jsonl
//! finder search "sales dashboard"
//! finder ask "where are the quarterly sales numbers?"
//! finder serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed failure kinds |
//! | [`normalize`] | Raw record → typed object |
//! | [`embedding`] | Embedding providers and the shared embedder |
//! | [`store`] | Index storage traits and the SQLite store |
//! | [`ingest`] | Ingestion runs |
//! | [`embed_cmd`] | Embedding backfill and rebuild |
//! | [`planner`] | Hybrid query planning |
//! | [`fusion`] | Score fusion |
//! | [`vector_index`] | In-memory nearest-neighbour index |
//! | [`conversation`] | Conversation history and turn handling |
//! | [`generator`] | Answer generation |
//! | [`retry`] | Timeouts and backoff for external calls |
//! | [`app`] | Process-wide component wiring |
//! | [`search`] | CLI search, similar and ask commands |
//! | [`stats`] | Index statistics |
//! | [`server`] | HTTP JSON API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod generator;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod planner;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod vector_index;
