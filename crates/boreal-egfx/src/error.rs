use thiserror::Error;

/// Fatal video-transport setup failures.
///
/// Both variants close the connection with a video-init failure; there is no
/// retry inside the transport core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VideoInitError {
    /// No advertised capability set supports even AVC420.
    #[error("client advertised no capability set usable for H.264 video")]
    NegotiationRefused,

    /// The wire library rejected opening the graphics pipeline channel.
    #[error("graphics pipeline context could not be opened")]
    ContextOpenFailed,
}
