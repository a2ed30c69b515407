//! # kbsync
//!
//! Keeps a vector index of a local knowledge base in sync with the files on
//! disk, and answers questions from it.
//!
//! Each update cycle hashes the knowledge base, compares the hashes with the
//! manifest of the previous cycle, and re-indexes only what was added or
//! modified. Entries of deleted and modified files are removed from the index
//! first. Cycles run on demand, on a timer, or after a burst of file changes
//! settles.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌────────────┐   ┌─────────────┐
//! │  Triggers   │──▶│  Scanner   │──▶│  Changes    │──▶│ Load/Chunk   │
//! │ timer/watch │   │  SHA-256   │   │ vs manifest │   │   + Embed    │
//! └────────────┘   └───────────┘   └────────────┘   └──────┬──────┘
//!                                                          ▼
//!                  ┌──────────┐    ┌────────────┐   ┌─────────────┐
//!                  │ ask/HTTP │◀───│  RAG        │◀──│ Vector index │
//!                  └──────────┘    └────────────┘   │ + manifest   │
//!                                                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbsync update                         # one incremental cycle
//! kbsync update --force-rebuild         # re-index everything
//! kbsync schedule --config config/scheduler.json
//! kbsync ask "How do I rotate the API keys?"
//! kbsync serve                          # POST /ask, GET /model_info
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML application config and JSON scheduler config |
//! | [`models`] | Core data types |
//! | [`hasher`] | Streaming SHA-256 of file contents |
//! | [`scanner`] | Knowledge-base walk |
//! | [`changes`] | Added/modified/deleted detection |
//! | [`extract`] | PDF and Word text extraction |
//! | [`loader`] | File → raw document |
//! | [`chunk`] | Overlapping text windows |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | File-backed vector index |
//! | [`manifest`] | Last committed file hashes |
//! | [`lock`] | Cross-process update lock |
//! | [`progress`] | Update phase reporting |
//! | [`updater`] | The incremental update cycle |
//! | [`watcher`] | File watching with debouncing |
//! | [`scheduler`] | Timer, watch, and manual triggers |
//! | [`chat`] | Chat-completion providers |
//! | [`rag`] | Retrieval-augmented answering |
//! | [`server`] | HTTP API |
//! | [`status`] | Sync status summary |
//! | [`logging`] | `tracing` setup |

pub mod changes;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod hasher;
pub mod index;
pub mod loader;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod models;
pub mod progress;
pub mod rag;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod updater;
pub mod watcher;
