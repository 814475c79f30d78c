//! Service endpoint resolution.
//!
//! The pool asks a [`ServiceEndpointResolver`] for the endpoints of a
//! destination and starts connecting as soon as the first ones are
//! published. Two implementations ship with the crate:
//! - [`HickoryResolver`]: async hickory-dns lookups (AAAA and A in parallel)
//! - [`StaticResolver`]: fixed host table with an optional fallback
//!
//! # Example
//!
//! ```rust,ignore
//! use streampool::dns::{StaticResolver, HickoryResolver};
//! use std::sync::Arc;
//!
//! let resolver = StaticResolver::new()
//!     .with_host("api.local", vec!["127.0.0.1".parse()?])
//!     .with_fallback(Arc::new(HickoryResolver::new()));
//! ```

mod hickory;
mod resolve;

pub use hickory::HickoryResolver;
pub use resolve::{
    prefer_ipv6, EndpointUpdate, Name, Resolving, ServiceEndpointRequest, ServiceEndpointResolver,
    StaticResolver,
};
