//! # streampool
//!
//! A Chromium-inspired stream pool for Rust.
//!
//! `streampool` decides when, where, and how many connections to open for
//! each destination, and hands established streams to waiting requests.
//!
//! ## Features
//!
//! - **Limits**: 6 streams per destination, 256 per pool (Chromium defaults)
//! - **Happy Eyeballs**: Races endpoints as the resolver reports them
//! - **Priorities**: Higher priority requests get streams and freed capacity first
//! - **Fatal Errors**: Certificate and client-certificate errors are latched
//!   and shared by every request to the destination
//! - **Signals**: IP address and security configuration changes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use streampool::base::priority::RequestPriority;
//! use streampool::socket::{Scheme, StreamKey, StreamPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = StreamPool::new().unwrap();
//!     let key = StreamKey::new(Scheme::Https, "example.com", 443);
//!     let stream = pool.request_stream(key, RequestPriority::Medium).await.unwrap();
//!     println!("connected to {}", stream.endpoint());
//!     stream.release();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types and error definitions
//! - [`dns`] - Service endpoint resolution
//! - [`socket`] - Stream pool, jobs, attempts, and TLS

pub mod base;
pub mod dns;
pub mod socket;

pub use base::neterror::NetError;
pub use base::priority::RequestPriority;
pub use socket::{StreamError, StreamKey, StreamPool, StreamRequest};
