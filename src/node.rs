//! The node-sink / node-source collaborator interfaces.
//!
//! `NodeWriter` and `NodeReader` are the minimum surface the pipeline
//! demands of whatever actually stores a ShardStream — an append-only
//! byte sink with metadata attachment, and a readable counterpart. The
//! node-side block store itself (file layout, fsync policy, network
//! transport) is out of scope; only this interface is specified.
//!
//! Modeled as hand-rolled `Pin<Box<dyn Future>>`-returning trait methods,
//! the same object-safe async-trait shape the storage backend trait in
//! the source workspace uses, so `Vec<Box<dyn NodeWriter>>` /
//! `Vec<Option<Box<dyn NodeReader>>>` can be passed around as ordinary
//! values.

use crate::error::{CoreError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One of the M append-only byte sinks a write pipeline drives.
pub trait NodeWriter: Send {
    /// Append bytes. Never a short write on success.
    fn write<'a>(&'a mut self, data: Bytes) -> BoxFuture<'a, Result<usize>>;

    /// Replace the caller-supplied UserMetadata. Valid any time before
    /// `close`/`close_with_error`.
    fn set_user_metadata(&mut self, metadata: HashMap<String, String>);

    /// Attach the Envelope. Valid any time before `close`/`close_with_error`.
    fn set_envelope(&mut self, envelope: HashMap<String, String>);

    /// Durably attach UserMetadata + Envelope and close. Exactly one of
    /// `close`/`close_with_error` is ever called on a given NodeWriter.
    fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<()>>;

    /// Close carrying a failure cause; no metadata is attached.
    fn close_with_error<'a>(&'a mut self, cause: CoreError) -> BoxFuture<'a, ()>;
}

/// One of up to M read-only byte sources a read pipeline draws from.
pub trait NodeReader: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` signals end-of-stream.
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>>;

    /// The Envelope this node recorded at write time.
    fn envelope(&self) -> HashMap<String, String>;

    /// The UserMetadata this node recorded at write time.
    fn user_metadata(&self) -> HashMap<String, String>;

    /// Release the node source. Infallible from the pipeline's perspective.
    fn close<'a>(&'a mut self) -> BoxFuture<'a, ()>;
}

/// In-memory `NodeWriter`/`NodeReader` pair, for tests.
///
/// Grounded on the pack's in-memory storage backend: a `Vec<u8>` buffer
/// behind a shared handle, with no persistence and no I/O latency.
pub mod testutil {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SharedState {
        data: Vec<u8>,
        user_metadata: HashMap<String, String>,
        envelope: HashMap<String, String>,
        closed: bool,
        failed: bool,
        close_error: Option<CoreError>,
    }

    /// A handle to one simulated node's storage, shared between the
    /// writer and reader ends created from it.
    #[derive(Clone, Default)]
    pub struct MemoryNode {
        state: Arc<Mutex<SharedState>>,
    }

    impl MemoryNode {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writer(&self) -> MemoryNodeWriter {
            MemoryNodeWriter {
                state: self.state.clone(),
            }
        }

        /// A reader over whatever has been written so far. Returns `None`
        /// if the node never closed successfully (simulates "unreadable
        /// node"), matching a Read Pipeline source that never came up.
        pub fn reader(&self) -> Option<MemoryNodeReader> {
            let guard = self.state.lock().unwrap();
            if guard.closed && !guard.failed {
                Some(MemoryNodeReader {
                    state: self.state.clone(),
                    cursor: 0,
                })
            } else {
                None
            }
        }

        pub fn bytes_written(&self) -> usize {
            self.state.lock().unwrap().data.len()
        }

        /// The cause passed to `close_with_error`, if this node was ever
        /// closed that way.
        pub fn close_error(&self) -> Option<CoreError> {
            self.state.lock().unwrap().close_error.clone()
        }
    }

    pub struct MemoryNodeWriter {
        state: Arc<Mutex<SharedState>>,
    }

    impl NodeWriter for MemoryNodeWriter {
        fn write<'a>(&'a mut self, data: Bytes) -> BoxFuture<'a, Result<usize>> {
            Box::pin(async move {
                let mut guard = self.state.lock().unwrap();
                guard.data.extend_from_slice(&data);
                Ok(data.len())
            })
        }

        fn set_user_metadata(&mut self, metadata: HashMap<String, String>) {
            self.state.lock().unwrap().user_metadata = metadata;
        }

        fn set_envelope(&mut self, envelope: HashMap<String, String>) {
            self.state.lock().unwrap().envelope = envelope;
        }

        fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.state.lock().unwrap().closed = true;
                Ok(())
            })
        }

        fn close_with_error<'a>(&'a mut self, cause: CoreError) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let mut guard = self.state.lock().unwrap();
                guard.closed = true;
                guard.failed = true;
                guard.close_error = Some(cause);
            })
        }
    }

    pub struct MemoryNodeReader {
        state: Arc<Mutex<SharedState>>,
        cursor: usize,
    }

    impl NodeReader for MemoryNodeReader {
        fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
            Box::pin(async move {
                let guard = self.state.lock().unwrap();
                let remaining = &guard.data[self.cursor.min(guard.data.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.cursor += n;
                Ok(n)
            })
        }

        fn envelope(&self) -> HashMap<String, String> {
            self.state.lock().unwrap().envelope.clone()
        }

        fn user_metadata(&self) -> HashMap<String, String> {
            self.state.lock().unwrap().user_metadata.clone()
        }

        fn close<'a>(&'a mut self) -> BoxFuture<'a, ()> {
            Box::pin(async move {})
        }
    }

    /// A `NodeWriter` whose writes (and close) always fail, for exercising
    /// the write pipeline's durability policy.
    pub struct FailingNodeWriter {
        pub fail_after_writes: usize,
        writes_seen: usize,
    }

    impl FailingNodeWriter {
        pub fn new(fail_after_writes: usize) -> Self {
            Self {
                fail_after_writes,
                writes_seen: 0,
            }
        }
    }

    impl NodeWriter for FailingNodeWriter {
        fn write<'a>(&'a mut self, data: Bytes) -> BoxFuture<'a, Result<usize>> {
            Box::pin(async move {
                if self.writes_seen >= self.fail_after_writes {
                    return Err(CoreError::NodeWrite {
                        node_index: 0,
                        message: "simulated disk failure".to_string(),
                    });
                }
                self.writes_seen += 1;
                Ok(data.len())
            })
        }

        fn set_user_metadata(&mut self, _metadata: HashMap<String, String>) {}
        fn set_envelope(&mut self, _envelope: HashMap<String, String>) {}

        fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { Ok(()) })
        }

        fn close_with_error<'a>(&'a mut self, _cause: CoreError) -> BoxFuture<'a, ()> {
            Box::pin(async move {})
        }
    }
}
