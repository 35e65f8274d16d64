//! RTCP is the control protocol of a TCP based transport for pub/sub middleware. Peers connect
//!  over a TCP stream, bind the connection in a handshake, and then multiplex any number of
//!  logical channels ('logical ports') over the single stream.
//!
//! ## Design goals
//!
//! * Connections are asymmetric during setup only: the connecting side sends a bind request,
//!   the accepting side answers it. After that, both sides are equal peers.
//! * Logical ports are negotiated per connection. A side that wants to send on a logical port
//!   asks the peer to open it, and only sends application data after the peer confirmed.
//!   * a peer that does not (yet) accept a logical port answers 'invalid port'. The sender keeps
//!     the port pending and re-checks.
//!   * a peer that receives data on a port it no longer accepts notifies the sender, which
//!     moves the port back to pending
//! * Liveness is checked with explicit keep alive requests, driven by the transport
//! * Every frame carries a CRC-32C; frames that fail the check are dropped and logged
//! * There is no retransmission in the protocol itself - TCP takes care of that. Requests that
//!   are never answered are discarded after a configurable timeout.
//! * Each connection has a dedicated worker thread for reading. Sending happens on the
//!   caller's thread, with a per-connection lock making "check state, send, change state"
//!   atomic.
//!
//! ## Frames
//!
//! Every frame starts with a physical header:
//!
//! ```ascii
//!  0: magic "RTCP" (4 bytes)
//!  4: total frame length including this header (u32, network byte order)
//!  8: CRC-32C over everything after this header (u32, see below)
//! 12: logical port (u16, network byte order) - 0 for control messages
//! ```
//!
//! Frames for logical ports other than 0 carry application data, the payload follows the
//!  physical header directly. Their CRC is in network byte order.
//!
//! Control frames (logical port 0) continue with a control header:
//!
//! ```ascii
//!  0: kind (u8)
//!     * D1 bind connection request     E1 bind connection response
//!     * D2 open logical port request   E2 open logical port response
//!     * D3 check logical ports request E3 check logical ports response
//!     * D4 keep alive request          E4 keep alive response
//!     * D5 logical port is closed
//!     * D6 unbind connection
//!  1: flags (u8)
//!     * bit 0: little endian
//!     * bit 1: response
//!     * bit 2: must reply
//!     * bit 3: last fragment (always set - there is no fragmentation)
//!  2: length of control header, status code and payload (u16)
//!  4: transaction id (u32)
//! ```
//!
//! The sender chooses the byte order of a control frame. The CRC field in the physical header
//!  and all numbers in control header and payload follow the 'little endian' flag.
//!
//! Responses have a status code (u32) between control header and payload:
//!
//! ```ascii
//! 0 void, 1 ok, 2 server error, 3 unknown locator, 4 invalid port, 5 bad request,
//! 6 incompatible version, 7 existing connection
//! ```
//!
//! Payloads:
//!
//! ```ascii
//! bind request:                 protocol version (2 bytes), vendor id (2 bytes), locator
//! bind response:                locator
//! open logical port request:    logical port (u16)
//! check logical ports req/resp: number of ports (u32), logical port (u16) per entry
//! keep alive request:           locator
//! logical port is closed:       logical port (u16)
//! ```
//!
//! A locator is 24 bytes: kind (i32), port (u32 - physical port in the lower, logical port in
//!  the upper 16 bits) and a 16 byte address.

pub mod config;
pub mod connection_handle;
pub mod control_header;
pub mod control_listener;
pub mod control_messages;
pub mod end_point;
pub mod locator;
pub mod message_dispatcher;
pub mod message_framer;
pub mod physical_header;
pub mod receive_loop;
pub mod rtcp_message_manager;
pub mod safe_converter;
pub mod transaction;
pub mod util;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
