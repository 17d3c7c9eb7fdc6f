use crate::{
    BatchError, LinkBuilderError, LinkError, LoopbackError, ParityError, ProtocolError,
    SpeedError, SpeedTestBuilderError, TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum ZddeError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error("cannot decode a server reply")]
    Protocol(#[from] ProtocolError),
    #[error("server conversation failed")]
    Link(#[from] LinkError),
    #[error("cannot build `::zdde::Link`")]
    LinkBuilder(#[from] LinkBuilderError),
    #[error("bulk ray trace failed")]
    Batch(#[from] BatchError),
    #[error("cannot build `::zdde::Loopback`")]
    Loopback(#[from] LoopbackError),
    #[error("tracing paths disagree")]
    Parity(#[from] ParityError),
    #[error("cannot time the tracing paths")]
    Speed(#[from] SpeedError),
    #[error("cannot build `::zdde::SpeedTest`")]
    SpeedTestBuilder(#[from] SpeedTestBuilderError),
}
