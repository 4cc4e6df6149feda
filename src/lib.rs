//! # Corpus Context
//!
//! Indexes a markdown vault into vector embeddings and assembles
//! token-bounded context from it.
//!
//! Change notifications are collapsed into a deduplicating job queue, an
//! explicit state machine governs each embedding run, and a multi-strategy
//! assembler fits retrieved context into a fixed token budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Vault scan  │──▶│  Scheduler  │──▶│  JobQueue  │
//! │ / watcher   │   │ parse+store │   │ LWW, FIFO  │
//! └─────────────┘   └──────┬──────┘   └─────┬──────┘
//!                          │ snapshot       │ drain_batch
//!                          ▼                ▼
//!                   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//!                   │   Kernel   │◀──│ EmbedRunner │──▶│ Provider │
//!                   │  reducer   │   │ retry/defer │   │ HTTP     │
//!                   └────────────┘   └──────┬──────┘   └──────────┘
//!                                           ▼
//!                                    ┌─────────────┐   ┌────────────────┐
//!                                    │ EntityStore │──▶│ ContextManager │
//!                                    └─────────────┘   └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! corpus index                          # scan, ingest and embed the vault
//! corpus status                         # kernel state and backlog as JSON
//! corpus context "release plan" --target notes/plan.md --max-tokens 2000
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Jobs, context items, entity keys |
//! | [`queue`] | Deduplicating embed job queue |
//! | [`embedding`] | Embedding provider abstraction and error taxonomy |
//! | [`kernel`] | Run lifecycle state machine |
//! | [`runner`] | Embedding run loop |
//! | [`store`] | Entity storage and vector search |
//! | [`blocks`] | Markdown → source and heading blocks |
//! | [`connector_fs`] | Vault scanning |
//! | [`scheduler`] | Change notifications → store + queue |
//! | [`tokens`] | Process-wide token counter |
//! | [`context`] | Budgeted multi-strategy context assembly |
//! | [`progress`] | Run progress on stderr |

pub mod blocks;
pub mod config;
pub mod connector_fs;
pub mod context;
pub mod embedding;
pub mod kernel;
pub mod models;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod tokens;
