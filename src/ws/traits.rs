//! Core traits for the STOMP session layer.

use super::error::WsError;
use super::frame::Frame;

/// Receives everything a running session observes.
///
/// The session task calls these from its own task; implementations must not block.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl SessionHandler for Printer {
///     fn on_frame(&self, frame: Frame) {
///         println!("{}: {}", frame.command, frame.body);
///     }
///
///     fn on_closed(&self, error: WsError) {
///         println!("closed: {error}");
///     }
/// }
/// ```
pub trait SessionHandler: Send + Sync + 'static {
    /// A non-heartbeat frame arrived from the broker.
    fn on_frame(&self, frame: Frame);

    /// A frame could not be decoded. The session stays open.
    fn on_invalid_frame(&self, error: WsError);

    /// The session ended without being asked to. Not called after [`super::Session::close`].
    fn on_closed(&self, error: WsError);
}
