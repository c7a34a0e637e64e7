//! Damage-aware H.264 frame submission for an RDP server.
//!
//! This crate takes already-encoded video packets from a compositor-side
//! capture pipeline, pairs them with their damage/presentation metadata,
//! and turns them into RDPGFX surface-command frames via `boreal-egfx`:
//!
//! - [`PacketPairer`] joins encoded packets with late or missing side-channel
//!   metadata, degrading to full-frame updates.
//! - [`damage_rects`] clips and coalesces damage into RDP region rectangles.
//! - [`ActivityGrid`] and [`rect_quality`] pick per-region quantization.
//! - [`CongestionController`] turns RTT trend, client ACK lag and decoder
//!   queue depth into a target frame rate and a QP bias.
//! - [`VideoStream`] owns the bounded frame queue and the submission thread.

mod activity;
mod congestion;
mod damage;
mod frame;
mod geometry;
mod pairer;
mod quality;
mod stream;

pub use activity::*;
pub use congestion::*;
pub use damage::*;
pub use frame::*;
pub use geometry::*;
pub use pairer::*;
pub use quality::*;
pub use stream::*;

pub use boreal_egfx as egfx;
