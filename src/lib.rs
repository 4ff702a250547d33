//! ragchat: conversational retrieval-augmented generation
//!
//! Documents are chunked, embedded and indexed once at ingestion. Each
//! conversation turn retrieves evidence from the documents linked to the
//! conversation, fits it together with recent history into a fixed token
//! budget, and hands the assembled window to a text generator.

pub mod chunk;
pub mod commands;
pub mod config;
pub mod context;
pub mod conversation;
pub mod embed;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod meta;
pub mod progress;
pub mod retrieve;
pub mod tokens;
