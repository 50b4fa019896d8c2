//! PeSIT E protocol engine: parameter and FPDU codecs, transport framing,
//! chunked data plane, client session, and the server session state machine.
//! Storage, partner policy and transfer tracking are collaborator traits
//! implemented by the embedding binary.

pub mod connect;
pub mod diag;
pub mod error;
pub mod fpdu;
pub mod handler;
pub mod param;
pub mod parse;
pub mod reader;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
pub mod validate;
pub mod writer;

pub use connect::{AccessType, ConnectBuilder, CreateBuilder, MessageBuilder, SelectBuilder};
pub use diag::Diag;
pub use error::{CodecError, EngineError, SessionError, TransportError};
pub use fpdu::{Fpdu, FpduType};
pub use handler::SessionHandler;
pub use param::{Param, Pgi, PgiValue, Pi, PiValue};
pub use parse::parse_entity;
pub use reader::FpduReader;
pub use session::Session;
pub use state::{ServerState, SessionContext, TransferContext};
pub use transport::{TcpTransportChannel, TlsServerChannel, TlsTransportChannel, TransportChannel};
pub use writer::ChunkWriter;
