//! Robot wire transport: framing, envelope types, and the in-memory session
//! registry the Dispatcher and admin surface use to reach connected robots,
//! §4.3.
pub mod codec;
pub mod envelope;
pub mod session;

pub use codec::{EnvelopeCodec, PayloadFormat};
pub use envelope::{Envelope, MessageType};
pub use session::{RobotSession, SessionRegistry, SessionState};
