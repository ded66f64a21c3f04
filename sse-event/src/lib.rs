//! Wire-shape events for conclave streaming responses.
//!
//! One enum, [`StreamEvent`], covers the full taxonomy emitted by the stream
//! engine and the workflow executor: text/reasoning deltas, tool rounds and
//! calls, approval and proposal prompts, context compaction, inline elements
//! (plans, previews, artifacts), team progress, workflow node progress, and
//! the terminal `message_complete` / `token_usage` / `done` trio.
//!
//! Serialization is the transport-agnostic `{"event": ..., "data": {...}}`
//! shape; [`sse::sse_frame`] renders it as a Server-Sent Events frame.

pub mod event;
pub mod sse;

pub use event::{KbRef, StreamEvent, ToolCallStatus};
pub use sse::{sse_frame, write_sse_frame};
