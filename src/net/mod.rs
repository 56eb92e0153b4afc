//! Networking: framing, wire protocol, TLS and the WebTransport endpoint

pub mod framing;
pub mod protocol;
pub mod tls;
pub mod transport;
