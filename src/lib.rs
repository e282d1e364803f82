//! # qwen-gate
//!
//! An OpenAI-compatible HTTP gateway in front of the Qwen chat-completion
//! and web-search backend, whose credentials are short-lived OAuth tokens.
//!
//! The gateway terminates OpenAI-format requests, authenticates callers with
//! locally-issued hashed API keys, selects one of N vendor accounts, forwards
//! the call (buffered or SSE-streamed), keeps per-account daily counters, and
//! rotates accounts when the vendor reports quota or auth failure. Token
//! renewal happens proactively on a background scheduler and reactively on
//! auth failure, with at most one refresh in flight per account.
//!
//! ## Modules
//! - `account`: account pool, credential storage, eligibility state
//! - `oauth`: device flow, refresh exchange, background scheduler
//! - `router`: dispatch core (attempt loop, SSE normalization)
//! - `keys`: local API-key store and per-key rate limiting
//! - `usage`: per-account daily counters and stats files
//! - `api`: the HTTP surface

pub mod account;
pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod keys;
pub mod oauth;
pub mod router;
pub mod usage;

pub use config::Config;
