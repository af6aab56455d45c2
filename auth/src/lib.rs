//! Security configuration and request admission for the broker.
//!
//! This crate owns the immutable security record produced by the setup
//! wizard, the admission decision applied to every HTTP request, and the
//! single-use nonce store backing the editor-response endpoint. It is
//! deliberately framework-free: the HTTP layer hands in header strings and
//! a peer address, and gets back a decision.

mod admission;
mod config;
mod nonce;

pub use admission::{authorize, bearer_token, source_ip, AuthError, Credentials};
pub use config::{load_security_config, AccessMode, SecurityConfig};
pub use nonce::NonceStore;
