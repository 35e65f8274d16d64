#[cfg(test)] use mockall::automock;

/// The shared target that receives application payloads arriving on a connection's opened
///  logical ports. Connections hold it as an `Arc` without owning its lifetime.
///
/// Called on the connection's worker thread, so implementations should hand off non-trivial
///  work rather than block the receive loop.
#[cfg_attr(test, automock)]
pub trait MessageDispatcher: Send + Sync + 'static {
    fn on_message(&self, logical_port: u16, msg_buf: &[u8]);
}
