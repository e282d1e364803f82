//! HTTP surface of the gateway.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - OpenAI-compatible chat completion (buffered or SSE)
//! - `GET /v1/models` - model listing (cached)
//! - `POST /v1/web/search` - vendor web search
//! - `GET /health` - aggregate and per-account status
//! - `POST /auth/initiate` / `POST /auth/poll` - device-flow account authorization
//! - `POST /auth/refresh` - force refresh of every account
//! - `/api/keys`, `/api/accounts` - administration (full access required)

pub mod accounts_admin;
pub mod auth_flow;
pub mod health;
pub mod keys_admin;
pub mod openai;
pub mod routes;
pub mod search;
pub mod validator;

pub use routes::{build_router, build_state, serve, AppState};
