//!
//! # Server transport
//!
//! The DDE conversation is abstracted behind the [`Transport`] trait so the
//! rest of the crate never touches the IPC layer. A [`Link`](crate::Link)
//! drives any transport: the Windows DDE client in a companion crate, or the
//! in-process [`Loopback`](crate::Loopback) server this crate ships for tests
//! and benchmarks.

use std::time::Duration;

use crate::RayRecord;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no conversation with the server, the channel is closed")]
    Closed,
    #[error("the server did not reply within {0:?}")]
    TimedOut(Duration),
    #[error("the server rejected the exchange with status {0}")]
    Server(i32),
    #[error("transport i/o failure")]
    Io(#[from] std::io::Error),
}

/// One conversation with the server
///
/// Implementations carry the item request/reply exchange and the bulk ray
/// data exchange; everything above the transport speaks the grammar of
/// [`protocol`](crate::protocol)
pub trait Transport {
    /// Sends a text item and waits for the text reply
    fn request(&mut self, item: &str, timeout: Duration) -> Result<String, TransportError>;
    /// Sends the ray data records, header first, and writes the traced rays
    /// back into the same records
    fn exchange_rays(
        &mut self,
        records: &mut [RayRecord],
        timeout: Duration,
    ) -> Result<(), TransportError>;
    /// Ends the conversation, releasing the server
    fn terminate(self)
    where
        Self: Sized,
    {
    }
}
