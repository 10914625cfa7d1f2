//! Association protocol
//!
//! PDUs and their codec, the per-association state machine, the handle given
//! to applications and the manager that spawns and tracks associations.

pub mod codec;
pub mod handle;
mod manager;
pub mod message;
pub mod state;

pub use self::codec::PduCodec;
pub use self::handle::{AssociationEventListener, InboundAssociation, ProtocolHandle};
pub use self::manager::{AssociationInfo, ProtocolTransport};
pub use self::message::Pdu;
pub use self::state::AssociationState;
