//! The per-connection session bridge.
//!
//! Client frames flow through the [`router`] to the audio relay or the control
//! handler and on to the upstream; upstream frames flow through the
//! [`multiplexer`] to the turn accumulator, the tool-call aggregator and the
//! client. [`supervisor::ConnectionSupervisor`] ties these together as a pure
//! state machine and [`driver::SessionDriver`] runs it.

pub mod audio;
pub mod driver;
pub mod model;
pub mod multiplexer;
pub mod protocol;
pub mod router;
pub mod supervisor;
pub mod tools;
pub mod turn;

pub use driver::{SessionDriver, SessionHandle};
pub use model::{Lifecycle, Role, Session, Turn};
pub use protocol::{BridgeEvent, ClientControlMessage, ClientFrame, ClientRoute};
pub use supervisor::{ConnectionSupervisor, Effect, ResumePolicy, SessionInput, SessionSettings};
