//! Per-connection request handlers.
//!
//! External code supplies a factory; the session calls it once per accepted
//! connection so no handler state is ever shared between concurrent clients.
//! In answer mode the handler's returned bytes go back to the peer over the
//! same framed channel before the next request is read.

use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Handles decoded inbound payloads for one connection.
pub trait ConnectionHandler: Send {
    /// Process one request. `Ok(Some(bytes))` is the answer to send back in
    /// answer mode; `Ok(None)` means no answer. Errors are logged and the
    /// connection moves on to the next request.
    fn handle(&mut self, request: Vec<u8>) -> Result<Option<Vec<u8>>>;
}

/// Factory producing a fresh handler per accepted connection.
///
/// Context the handlers need (lookup tables, shared services) is captured by
/// the factory closure at construction time.
#[derive(Clone)]
pub struct HandlerSlot(Arc<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>);

impl HandlerSlot {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }

    /// Build a slot from a plain function applied to every request.
    pub fn from_fn<F>(handle: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<Option<Vec<u8>>> + Send + Sync + Clone + 'static,
    {
        Self::new(move || Box::new(FnHandler(handle.clone())))
    }

    /// Instantiate a handler for one new connection.
    pub fn instantiate(&self) -> Box<dyn ConnectionHandler> {
        (self.0)()
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerSlot(..)")
    }
}

struct FnHandler<F>(F);

impl<F> ConnectionHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Result<Option<Vec<u8>>> + Send,
{
    fn handle(&mut self, request: Vec<u8>) -> Result<Option<Vec<u8>>> {
        (self.0)(request)
    }
}
