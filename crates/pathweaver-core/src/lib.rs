//! # Pathweaver Core
//!
//! Shared, I/O-free logic for Pathweaver: data models, canonical keys and
//! hashing, adaptive parameters, stratified excerpts, concept inventory and
//! edge normalization, artifact input hashing, seed quality, activity
//! content repair, and PSU promotion rules.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Everything here is a pure function of its inputs so the stages built on
//! top of it stay deterministic and testable without external services.

pub mod activity;
pub mod adaptive;
pub mod artifact;
pub mod edges;
pub mod embedding;
pub mod excerpts;
pub mod formulas;
pub mod inventory;
pub mod keys;
pub mod models;
pub mod path_meta;
pub mod psu;
pub mod seeds;
pub mod text;
