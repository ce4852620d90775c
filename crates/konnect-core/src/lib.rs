#![forbid(unsafe_code)]
#![warn(
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Engine-agnostic transfer interfaces and DTOs.

pub mod error;
pub mod request;
pub mod response;

pub use error::{TransferError, TransferResult};
pub use request::{Method, Request, RequestBody, SUPPORTED_SCHEMES};
pub use response::{Response, ResponseHead, TransferId};

use async_trait::async_trait;

/// Anything able to carry a request to completion.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a request and await its response.
    async fn process(&self, request: Request) -> TransferResult<Response>;
}
