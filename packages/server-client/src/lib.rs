//! Download server job API client for Downbeat
//!
//! This crate provides a typed async client for the download server's job
//! API, covering:
//! - Job submission (track / album / playlist / artist fan-out)
//! - Status fetch by handle (poll transport)
//! - NDJSON status event streams (push transport)
//! - Cancellation, record deletion, and outstanding-job listing
//! - Server-supplied retry settings
//!
//! # Example
//!
//! ```rust,no_run
//! use downbeat_server_client::{DownloadsClient, ItemType, SubmitRequest};
//! use futures_util::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DownloadsClient::new("http://localhost:7480")?;
//!
//! let outcome = client
//!     .submit(&SubmitRequest::new("spotify:album:42", ItemType::Album))
//!     .await?;
//!
//! for handle in outcome.into_handles() {
//!     let mut events = client.events(&handle).await?;
//!     while let Some(event) = events.next().await {
//!         println!("{event:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod models;
mod stream;

pub use client::DownloadsClient;
pub use error::{ClientError, ClientResult};
pub use models::{
    ItemType, RetrySettings, StatusKind, StatusPayload, StatusRecord, StreamEvent, SubmitOptions,
    SubmitOutcome, SubmitRequest,
};
pub use stream::EventStream;
