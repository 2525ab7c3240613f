//! Network subsystem: UDP session with the PC server

pub mod loss;
pub mod session;
pub mod socket;

pub use loss::{calculate_gap, LossCounter, SequenceTracker, SequenceVerdict};
pub use session::{
    ConnectionState, PendingRequest, PendingRequests, RequestKind, Session, SessionConfig,
};
pub use socket::{bind_receive_socket, bind_send_socket};
