//! Streaming Primitives for the Relay
//!
//! The leaf components a relay session drives for every request:
//!
//! ```text
//!   upstream fragments
//!          │
//!          ▼
//!   ┌─────────────┐   units   ┌─────────┐  gate open?  ┌───────────┐
//!   │   Chunker   │ ────────► │  Pacer  │ ───────────► │ transport │
//!   └─────────────┘           └─────────┘              └───────────┘
//!                                  ▲
//!                      CancellationGate (set by the inbound reader)
//! ```
//!
//! - [`Chunker`]: regroups fragments per [`ChunkPolicy`]
//! - [`Pacer`]: process-wide delay before each outbound unit
//! - [`CancellationGate`]: cooperative, race-free cancel flag
//! - [`StreamStats`]: per-request counters logged at the terminal status

mod cancel;
mod chunker;
mod pacer;
mod stats;

pub use cancel::CancellationGate;
pub use chunker::{ChunkPolicy, Chunker};
pub use pacer::Pacer;
pub use stats::StreamStats;
