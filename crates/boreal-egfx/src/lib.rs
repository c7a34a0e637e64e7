//! Server-side glue for the Graphics Pipeline Virtual Channel ([MS-RDPEGFX]).
//!
//! This crate owns the wire-facing half of the Boreal video transport:
//! capability negotiation, surface lifecycle, frame-ID allocation and
//! pending-ACK tracking, and raw GFX PDU assembly. The damage/quality/pacing
//! pipeline that decides *what* to send lives in `boreal-video`.
//!
//! The channel integrates with a DVC server as a [`GfxChannelBridge`], which
//! wraps a shared [`GfxVideoChannel`] so that the submission thread can emit
//! frames proactively while the DVC infrastructure keeps handling client
//! messages:
//!
//! ```text
//! DrdynvcServer ──▶ GfxChannelBridge ──▶ Arc<Mutex<GfxVideoChannel>> ◀── submitter thread
//! ```
//!
//! [MS-RDPEGFX]: https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpegfx/da5c75f9-cd99-450c-98c4-014a496942b0

mod avc;
mod caps;
mod channel;
mod error;
mod session;

pub use avc::*;
pub use caps::*;
pub use channel::*;
pub use error::*;
pub use session::*;

pub use ironrdp_egfx::CHANNEL_NAME;
