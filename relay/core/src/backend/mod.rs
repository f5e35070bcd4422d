//! Upstream Backend Integration
//!
//! Abstracted access to upstream inference providers through a common trait
//! interface. The relay only ever sees a [`FragmentStream`].
//!
//! # Available Backends
//!
//! - **HuggingFace**: the Hugging Face inference router (default)
//! - **Scripted**: deterministic fragments for tests and offline runs
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{HuggingFaceBackend, UpstreamBackend, UpstreamRequest};
//!
//! let backend = HuggingFaceBackend::from_config(&config.upstream)?;
//! let request = UpstreamRequest::new(model, messages, 500);
//! let mut stream = backend.open_stream(&request).await?;
//! while let Some(fragment) = stream.next().await? { /* ... */ }
//! ```

mod huggingface;
pub mod scripted;
mod traits;

pub use huggingface::{parse_sse_line, HuggingFaceBackend, SseEvent};
pub use traits::{
    FragmentStream, StreamToken, UpstreamBackend, UpstreamError, UpstreamRequest,
    UpstreamResponse, FRAGMENT_CHANNEL_CAPACITY,
};
