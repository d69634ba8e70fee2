//! The read pipeline.
//!
//! `ReadHandle::open` spins up one reader task per live node source, each
//! pulling shards into its own channel, and a decode task that reads
//! exactly one message per round from every still-live node channel,
//! reconstructs the DataUnit, and feeds it into an internal
//! `tokio::io::duplex` pipe that the caller drains via `read`. Keeping
//! one channel per node (rather than one shared queue) is what keeps
//! round N's shards from a fast node from ever being mistaken for round
//! N+1's — nothing paces the node tasks against each other otherwise.
//!
//! Reading is poisoned, not merely ended, once the count of live node
//! sources drops below K: a plain EOF on the duplex pipe can't be told
//! apart from "ran out of data legitimately", so a shared failure slot is
//! checked on every `read` call and the poison, once set, never clears.

use crate::envelope::Envelope;
use crate::erasure::{Codec, Params};
use crate::error::{CoreError, Result};
use crate::node::NodeReader;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

const PIPE_CAPACITY: usize = 64 * 1024;
const NODE_CHANNEL_DEPTH: usize = 2;

/// Handle to an in-flight read.
///
/// Dropping (or explicitly `close`ing) a `ReadHandle` fires `cancel`,
/// which unblocks the decode task and every node-reader task out of
/// whatever node `read` call or channel recv they're suspended in, so a
/// network-backed `NodeReader` doesn't hang around after the caller has
/// moved on.
pub struct ReadHandle {
    pipe_out: DuplexStream,
    poison: Arc<Mutex<Option<CoreError>>>,
    envelope: Envelope,
    user_metadata: std::collections::HashMap<String, String>,
    cancel: CancellationToken,
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ShardMsg {
    Shard(Bytes),
    Eof,
    Err(CoreError),
}

impl ReadHandle {
    /// Open a read over up to M node sources. `nodes[i]` is `None` for a
    /// node source that never came up; fewer than K present is an
    /// immediate `InsufficientShards` failure, matching `Codec::decode`'s
    /// own threshold check.
    ///
    /// The Envelope is taken from the first available node source; reads
    /// are assumed to agree (the write pipeline attaches the same
    /// Envelope to all M nodes).
    #[instrument(skip(nodes), fields(k = params.k, m = params.m))]
    pub fn open(params: Params, mut nodes: Vec<Option<Box<dyn NodeReader>>>) -> Result<Self> {
        if nodes.len() != params.m {
            return Err(CoreError::InvalidParameters(format!(
                "expected {} node readers, got {}",
                params.m,
                nodes.len()
            )));
        }

        let live_count = nodes.iter().filter(|n| n.is_some()).count();
        if live_count < params.k {
            return Err(CoreError::InsufficientShards {
                available: live_count,
                required: params.k,
            });
        }

        let first_live = nodes.iter().flatten().next().ok_or_else(|| {
            CoreError::InsufficientShards {
                available: 0,
                required: params.k,
            }
        })?;
        let envelope = Envelope::from_map(&first_live.envelope())?;
        let user_metadata = first_live.user_metadata();

        let codec = Codec::new(params)?;

        // Per-chunk shard length, in ChunkIndex order: the non-final
        // chunks are all exactly `shard_size(block_size)`, the last one is
        // `shard_size` of whatever is actually left over. Shared with every
        // node reader task so each can fill its buffer to the right length
        // instead of forwarding whatever a single `read` call happens to
        // return.
        let mut shard_lens = Vec::with_capacity(envelope.chunk_count as usize);
        let mut remaining = envelope.total_length;
        for chunk_index in 0..envelope.chunk_count {
            let unit_len = if chunk_index + 1 == envelope.chunk_count {
                remaining as usize
            } else {
                envelope.block_size as usize
            };
            shard_lens.push(codec.shard_size(unit_len));
            remaining -= unit_len as u64;
        }
        let shard_lens = Arc::new(shard_lens);

        let (pipe_in, pipe_out) = tokio::io::duplex(PIPE_CAPACITY);
        let poison = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let mut live = Vec::with_capacity(params.m);
        let mut receivers = Vec::with_capacity(params.m);
        for (index, node) in nodes.into_iter().enumerate() {
            match node {
                Some(node) => {
                    let (tx, rx) = mpsc::channel(NODE_CHANNEL_DEPTH);
                    tokio::spawn(node_reader_task(
                        index,
                        node,
                        shard_lens.clone(),
                        tx,
                        cancel.clone(),
                    ));
                    live.push(true);
                    receivers.push(Some(rx));
                }
                None => {
                    live.push(false);
                    receivers.push(None);
                }
            }
        }

        tokio::spawn(decode_task(
            codec,
            envelope.block_size,
            envelope.chunk_count,
            envelope.total_length,
            live,
            receivers,
            pipe_in,
            poison.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            pipe_out,
            poison,
            envelope,
            user_metadata,
            cancel,
        })
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The UserMetadata this object was written with, as recorded by
    /// whichever node source supplied the Envelope.
    pub fn user_metadata(&self) -> &std::collections::HashMap<String, String> {
        &self.user_metadata
    }

    /// Read up to `buf.len()` reconstructed bytes. `Ok(0)` means the
    /// object has been fully delivered. Once poisoned, every subsequent
    /// call returns the same error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(cause) = self.poison.lock().unwrap().clone() {
            return Err(cause);
        }
        let n = self
            .pipe_out
            .read(buf)
            .await
            .map_err(|e| CoreError::DecodeFailure(e.to_string()))?;
        if n == 0 {
            if let Some(cause) = self.poison.lock().unwrap().clone() {
                return Err(cause);
            }
        }
        Ok(n)
    }

    /// Release the read. Infallible. Fires `cancel`, which propagates to
    /// the decode task and every node-reader task so each still-live
    /// `NodeReader` is unblocked out of whatever `read` call it's
    /// suspended in rather than being abandoned mid-call.
    pub async fn close(self) {
        self.cancel.cancel();
    }
}

/// Reads one shard per `ChunkIndex`, in order, into `tx`. `NodeReader::read`
/// is allowed a legitimate partial (non-EOF) read per its own contract, so
/// each shard is filled in a loop rather than forwarded from a single call;
/// only a genuine 0-byte read before the shard is full counts as this
/// node's end-of-stream.
///
/// `cancel` is raced against every `node.read` call so a handle-drop/close
/// unblocks this task out of a stalled node read rather than waiting for it
/// to return on its own.
async fn node_reader_task(
    index: usize,
    mut node: Box<dyn NodeReader>,
    shard_lens: Arc<Vec<usize>>,
    tx: mpsc::Sender<ShardMsg>,
    cancel: CancellationToken,
) {
    for &expected_len in shard_lens.iter() {
        let mut buf = vec![0u8; expected_len];
        let mut filled = 0;
        while filled < expected_len {
            let read_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    node.close().await;
                    return;
                }
                result = node.read(&mut buf[filled..]) => result,
            };
            match read_result {
                Ok(0) => {
                    let _ = tx.send(ShardMsg::Eof).await;
                    node.close().await;
                    return;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    warn!(node = index, error = %e, "node read failed");
                    let _ = tx.send(ShardMsg::Err(e)).await;
                    node.close().await;
                    return;
                }
            }
        }
        if tx.send(ShardMsg::Shard(Bytes::from(buf))).await.is_err() {
            node.close().await;
            return;
        }
    }
    node.close().await;
}

#[instrument(skip_all)]
async fn decode_task(
    codec: Codec,
    block_size: u64,
    chunk_count: u64,
    total_length: u64,
    mut live: Vec<bool>,
    mut receivers: Vec<Option<mpsc::Receiver<ShardMsg>>>,
    mut pipe_in: DuplexStream,
    poison: Arc<Mutex<Option<CoreError>>>,
    cancel: CancellationToken,
) {
    let m = live.len();
    let k = codec.params().k;
    let mut bytes_remaining = total_length;

    for chunk_index in 0..chunk_count {
        let mut current: Vec<Option<Bytes>> = vec![None; m];

        for index in 0..m {
            if !live[index] {
                continue;
            }
            let rx = receivers[index].as_mut().expect("live implies a channel");
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                msg = rx.recv() => msg,
            };
            match msg {
                Some(ShardMsg::Shard(data)) => current[index] = Some(data),
                Some(ShardMsg::Eof) => {
                    warn!(node = index, "node source ended before object completed");
                    live[index] = false;
                }
                Some(ShardMsg::Err(cause)) => {
                    warn!(node = index, error = %cause, "node source dropped");
                    live[index] = false;
                }
                None => {
                    live[index] = false;
                }
            }
        }

        let live_count = live.iter().filter(|&&l| l).count();
        if live_count < k {
            *poison.lock().unwrap() = Some(CoreError::InsufficientShards {
                available: live_count,
                required: k,
            });
            return;
        }

        let unit_len = if chunk_index + 1 == chunk_count {
            bytes_remaining as usize
        } else {
            block_size as usize
        };

        let decoded = match codec.decode(&current, unit_len) {
            Ok(d) => d,
            Err(e) => {
                *poison.lock().unwrap() = Some(e);
                return;
            }
        };
        bytes_remaining -= decoded.len() as u64;

        if pipe_in.write_all(&decoded).await.is_err() {
            return;
        }
    }

    let _ = pipe_in.shutdown().await;
}
