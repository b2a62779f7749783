//! Shared test utilities for the Downbeat workspace
//!
//! This crate provides a mock download server so the queue subsystem and
//! the API client can be tested without network dependencies.
//!
//! # Example
//!
//! ```rust,ignore
//! use downbeat_test_utils::{events, JobFixture, MockDownloadServer};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockDownloadServer::start().await;
//!     server.mock_submit_single("trk_1").await;
//!     server
//!         .mock_status("trk_1", JobFixture::track("trk_1", "spotify:track:1").record_json())
//!         .await;
//!
//!     // Point your client at server.url()
//! }
//! ```

mod downloads;

pub use downloads::{events, JobFixture, MockDownloadServer};
