#![deny(missing_docs)]

//! Core library for the rustykb knowledge-base server.

/// HTTP routing and streaming handlers.
pub mod api;
/// Narrow interfaces to artifact, organization, usage and job storage.
pub mod catalog;
/// Environment-driven configuration management.
pub mod config;
/// Chunk storage and scoped search backends.
pub mod index;
/// Extraction, chunking, embedding and the durable ingestion queue.
pub mod ingestion;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion and answering counters.
pub mod metrics;
/// Model provider abstraction, retries and fallback.
pub mod provider;
/// Grounded answering and single-artifact chat.
pub mod rag;
/// Vector retrieval and hybrid search.
pub mod retrieval;
/// Composition root and the operations exposed to the CRUD layer.
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
