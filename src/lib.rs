//! Latency and throughput measurements between two endpoints, over a stream transport (TCP) and
//!  a datagram transport (UDP) sharing one request / response protocol.
//!
//! Every request starts with a [header](header::Header) carrying the request kind, the total
//!  number of payload bytes, and the chunk size. The client sends the payload chunk by chunk, and
//!  the server answers each chunk as the request kind prescribes (see [dispatcher]):
//!
//! ```ascii
//! AckRequest:                ---chunk-->  <--ACK--
//! EchoRequest:               ---chunk-->  <--chunk--
//! ThroughputMetricsRequest:  ---chunk-->  <--ACK--  <--chunk--  ---ACK-->  <--nanos (i64)--
//! CloseConnection:           (no payload, the server ends the session)
//! ```
//!
//! All numbers are big-endian. The stream transport carries messages as they are. The datagram
//!  transport sends short messages as plain datagrams, and large messages using a
//!  [reliable bulk transfer](datagram::bulk) protocol on top of them.
//!
//! There is no pipelining: a client sends its next request only after it consumed the complete
//!  reply sequence of the previous one.

pub mod config;
pub mod connection;
pub mod datagram;
pub mod dispatcher;
pub mod error;
pub mod header;
pub mod measurement;
pub mod server;
pub mod stream;
pub mod test_util;
pub mod util;
