//! modelgate-gateway: HTTP front-end for the model gateway
//!
//! Serves `POST /v1/chat/completions` and `POST /v1/messages` on top of
//! `modelgate-core`, plus a small bearer-protected admin API.

pub mod admin;
pub mod auth;
pub mod pipeline;
pub mod protocol;
pub mod server;

pub use server::{GatewayServer, GatewaySettings, GatewayState, build_router};
