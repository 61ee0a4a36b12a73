//! # Pathweaver
//!
//! Citation-grounded learning paths built from uploaded materials.
//!
//! Pathweaver turns a material set (files split into chunks) into a
//! per-path concept graph whose every concept cites the chunks it came
//! from, then realizes activities for the path's nodes from retrieved
//! excerpts. Work is split into idempotent stages that a job queue runs in
//! order; each stage caches its output by input fingerprint and records
//! saga actions so external writes can be undone when a job fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────────┐   ┌────────────────────┐
//! │ embed_chunks │──▶│ concept_graph_build │──▶│ realize_activities │
//! └──────┬───────┘   └──────────┬──────────┘   └─────────┬──────────┘
//!        │           concept_graph_patch                 │
//!        ▼                      ▼                        ▼
//!   ┌─────────┐          ┌────────────┐           ┌────────────┐
//!   │ Postgres│◀─ saga ─▶│  vectors   │           │   mirror   │
//!   └─────────┘          └────────────┘           └────────────┘
//! ```
//!
//! Canonical rows live in Postgres. Vectors and the graph mirror are
//! caches written after commit.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`stages`] | Stage contract, registry and the four stages |
//! | [`coverage`] | Iterative coverage completion of an inventory |
//! | [`retrieval`] | Graph-assisted chunk selection |
//! | [`section_graph`] | Cross-document section similarity graph |
//! | [`canonical`] | Linking path concepts to global concepts |
//! | [`artifact_cache`] | Stage output cache keyed by input hash |
//! | [`saga`] | Compensating actions for external writes |
//! | [`prompts`] | Prompt builders and response decoders |
//! | [`llm`] | LLM client abstraction and OpenAI client |
//! | [`vectors`] | Vector store abstraction and Pinecone client |
//! | [`store`] | Relational store trait, Postgres and in-memory |
//! | [`mirror`] | External graph mirror |
//! | [`object_store`] | Object storage for uploaded files |
//! | [`progress`] | Throttled stage progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! Pure algorithms (normalization, excerpts, adaptive parameters, hashing,
//! activity repair) live in the `pathweaver-core` crate.

pub mod artifact_cache;
pub mod canonical;
pub mod config;
pub mod coverage;
pub mod db;
pub mod env;
pub mod error;
pub mod llm;
pub mod migrate;
pub mod mirror;
pub mod object_store;
pub mod progress;
pub mod prompts;
pub mod retrieval;
pub mod saga;
pub mod section_graph;
pub mod stages;
pub mod store;
pub mod vectors;
