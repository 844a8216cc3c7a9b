//! # Tech Copilot
//!
//! Backend for a field-service assistant. Technicians look up equipment
//! service manuals, ask questions answered from indexed manual excerpts,
//! and get cached AI troubleshooting guidance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌───────────┐
//! │ PDF upload  │──▶│ Extract + Chunk  │──▶│  SQLite   │
//! │ web search  │   │ + Embed          │   │ chunks+vec│
//! └─────────────┘   └──────────────────┘   └─────┬─────┘
//!                                                │
//!                  ┌─────────────────────────────┤
//!                  ▼                             ▼
//!            ┌───────────┐   ┌──────────┐   ┌──────────┐
//!            │ RAG query │──▶│ LLM      │◀──│ Trouble- │
//!            └───────────┘   │ gateway  │   │ shoot +  │
//!                            └──────────┘   │ cache    │
//!                                           └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`auth`] | Users, password hashing, bearer tokens |
//! | [`storage`] | Manual PDF file store |
//! | [`extract`] | PDF page text and section headers |
//! | [`chunk`] | Section-aware chunking |
//! | [`embedding`] | Embedding providers and vector math |
//! | [`indexing`] | Manual indexing pipeline |
//! | [`manuals`] | Manual library and web search |
//! | [`rag`] | Retrieval-augmented question answering |
//! | [`llm`] | Language model catalog and provider clients |
//! | [`model_select`] | Cost-aware model choice |
//! | [`cache`] | Troubleshooting response cache |
//! | [`troubleshoot`] | AI troubleshooting flow |
//! | [`equipment`] | Equipment profiles and service history |
//! | [`usage`] | API usage and cost accounting |
//! | [`system`] | Health and library statistics |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod auth;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod equipment;
pub mod error;
pub mod extract;
pub mod indexing;
pub mod llm;
pub mod manuals;
pub mod migrate;
pub mod model_select;
pub mod rag;
pub mod server;
pub mod state;
pub mod storage;
pub mod system;
pub mod troubleshoot;
pub mod usage;
