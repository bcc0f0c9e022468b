//! # outcache
//!
//! HTTP output caching for async Rust services.
//!
//! The engine sits between incoming requests and the handler that produces
//! responses. It keys responses by method, host, path and whichever request
//! headers, query parameters or custom values the route varies by; serves
//! fresh entries without calling the handler; collapses concurrent misses on
//! the same key into one handler call; and evicts entries in bulk by tag.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use outcache::cache::{BackendError, CachePolicy, OutputCache, OutputCacheOptions};
//! use outcache::{Method, Request, Response, StatusCode};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), BackendError> {
//! let options = OutputCacheOptions::default().route(
//!     "/items",
//!     CachePolicy::new()
//!         .expire(Duration::from_secs(300))
//!         .vary_by_query("category")
//!         .tag("catalog"),
//! );
//! let cache = OutputCache::new(options);
//!
//! let response = cache
//!     .execute(Request::new(Method::Get, "/items?category=shoes"), |_req| async {
//!         Ok::<_, BackendError>(Response::new(StatusCode::Ok).body("[\"sneaker\"]"))
//!     })
//!     .await?;
//! assert_eq!(response.status(), StatusCode::Ok);
//!
//! // Drop everything tagged "catalog" after the catalog changes.
//! cache.invalidate_by_tag("catalog").await.ok();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;

pub use http::{Headers, Method, Request, Response, StatusCode};
