//! The write pipeline.
//!
//! `WriteHandle::open` spins up a background task that reads DataUnits
//! from an internal `tokio::io::duplex` pipe, erasure-encodes each one,
//! and fans the resulting shards out to M node-worker tasks over bounded
//! `mpsc` channels. The caller only ever touches the duplex pipe's write
//! half, via `append`.
//!
//! Durability is judged once, at `close`: if fewer than K of the M node
//! sinks finished their close successfully, the whole write fails
//! `InsufficientDurability` even though individual shard writes may have
//! looked fine in flight.

use crate::chunk::Chunker;
use crate::envelope::Envelope;
use crate::erasure::{Codec, Params};
use crate::error::{CoreError, Result};
use crate::node::NodeWriter;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const PIPE_CAPACITY: usize = 64 * 1024;
const NODE_CHANNEL_DEPTH: usize = 4;

enum NodeMsg {
    Shard(Bytes),
    Finalize {
        envelope: HashMap<String, String>,
        user_metadata: HashMap<String, String>,
    },
    Abort(CoreError),
}

/// Handle to an in-flight write. Drop without calling `close`/`abort` and
/// the background tasks are left to fail on a closed pipe; prefer an
/// explicit terminal call.
pub struct WriteHandle {
    pipe_in: Option<DuplexStream>,
    completion: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
    abort_cause: Arc<Mutex<Option<CoreError>>>,
    user_metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl WriteHandle {
    /// Start a write of (up to) `total_length` bytes, encoded with
    /// `params` and fanned out across `nodes` (must have length `params.m`).
    #[instrument(skip(nodes, user_metadata), fields(k = params.k, m = params.m))]
    pub fn open(
        params: Params,
        block_size: usize,
        nodes: Vec<Box<dyn NodeWriter>>,
        user_metadata: HashMap<String, String>,
    ) -> Result<Self> {
        if nodes.len() != params.m {
            return Err(CoreError::InvalidParameters(format!(
                "expected {} node writers, got {}",
                params.m,
                nodes.len()
            )));
        }
        let codec = Codec::new(params)?;
        let user_metadata = Arc::new(Mutex::new(user_metadata));

        let (pipe_in, pipe_out) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let abort_cause: Arc<Mutex<Option<CoreError>>> = Arc::new(Mutex::new(None));
        let (completion_tx, completion_rx) = oneshot::channel();

        let (node_senders, node_receivers): (Vec<_>, Vec<_>) = (0..params.m)
            .map(|_| mpsc::channel::<NodeMsg>(NODE_CHANNEL_DEPTH))
            .unzip();

        let total_success = Arc::new(AtomicUsize::new(0));
        let mut worker_handles = Vec::with_capacity(nodes.len());
        for (index, (node, rx)) in nodes.into_iter().zip(node_receivers).enumerate() {
            let total_success = total_success.clone();
            worker_handles.push(tokio::spawn(node_worker(index, node, rx, total_success)));
        }

        let encode_cancel = cancel.clone();
        let encode_abort_cause = abort_cause.clone();
        let encode_metadata = user_metadata.clone();
        tokio::spawn(encode_task(
            pipe_out,
            codec,
            block_size,
            encode_metadata,
            node_senders,
            worker_handles,
            params.k,
            total_success,
            encode_cancel,
            encode_abort_cause,
            completion_tx,
        ));

        Ok(Self {
            pipe_in: Some(pipe_in),
            completion: completion_rx,
            cancel,
            abort_cause,
            user_metadata,
        })
    }

    /// Append bytes to the object being written.
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let pipe = self
            .pipe_in
            .as_mut()
            .ok_or_else(|| CoreError::Canceled("append called after close".to_string()))?;
        pipe.write_all(data)
            .await
            .map_err(|e| CoreError::UpstreamRead(e.to_string()))
    }

    /// Replace the UserMetadata attached to this object. Idempotent and
    /// last-writer-wins: valid any time before `close`/`abort`, and a
    /// later call simply overwrites an earlier one. The encode task reads
    /// this by value only once, when it finalizes at `close`.
    pub fn set_metadata(&self, metadata: HashMap<String, String>) {
        *self.user_metadata.lock().unwrap() = metadata;
    }

    /// A defensive copy of the UserMetadata currently staged for this
    /// object; mutating the returned map has no effect on the handle.
    pub fn get_metadata(&self) -> HashMap<String, String> {
        self.user_metadata.lock().unwrap().clone()
    }

    /// Signal end-of-object and wait for the durability verdict.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut pipe) = self.pipe_in.take() {
            let _ = pipe.shutdown().await;
        }
        self.completion
            .await
            .map_err(|_| CoreError::Canceled("encode task dropped without a verdict".to_string()))?
    }

    /// Abandon the write. Every node worker is told to discard state via
    /// `close_with_error` carrying `cause`, and no durability check is
    /// performed.
    pub async fn abort(mut self, cause: CoreError) {
        *self.abort_cause.lock().unwrap() = Some(cause);
        self.cancel.cancel();
        if let Some(mut pipe) = self.pipe_in.take() {
            let _ = pipe.shutdown().await;
        }
        let _ = self.completion.await;
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
async fn encode_task(
    pipe_out: DuplexStream,
    codec: Codec,
    block_size: usize,
    user_metadata: Arc<Mutex<HashMap<String, String>>>,
    node_senders: Vec<mpsc::Sender<NodeMsg>>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    k: usize,
    total_success: Arc<AtomicUsize>,
    cancel: CancellationToken,
    abort_cause: Arc<Mutex<Option<CoreError>>>,
    completion_tx: oneshot::Sender<Result<()>>,
) {
    let mut chunker = Chunker::new(pipe_out, block_size);
    let mut chunk_count: u64 = 0;
    let mut total_length: u64 = 0;
    let mut failure: Option<CoreError> = None;

    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                failure = Some(abort_cause.lock().unwrap().clone().unwrap_or_else(|| {
                    CoreError::Canceled("write aborted".to_string())
                }));
                break;
            }
            unit = chunker.next_unit() => unit,
        };

        let Some(unit) = unit else { break };
        let data = match unit {
            Ok(data) => data,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };

        total_length += data.len() as u64;
        chunk_count += 1;

        let shards = match codec.encode(&data) {
            Ok(shards) => shards,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };

        for (sender, shard) in node_senders.iter().zip(shards) {
            if sender.send(NodeMsg::Shard(shard)).await.is_err() {
                debug!("node worker channel closed mid-stream");
            }
        }
    }

    let envelope = Envelope {
        block_size: block_size as u64,
        chunk_count,
        total_length,
        erasure_k: codec.params().k,
        erasure_m: codec.params().m,
        erasure_technique: codec.params().technique,
        created: Utc::now(),
        extra: HashMap::new(),
    }
    .to_map();

    let outcome = if let Some(cause) = failure {
        for sender in &node_senders {
            let _ = sender.send(NodeMsg::Abort(cause.clone())).await;
        }
        for sender in node_senders {
            drop(sender);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }
        Err(cause)
    } else {
        let user_metadata = user_metadata.lock().unwrap().clone();
        for sender in &node_senders {
            let _ = sender
                .send(NodeMsg::Finalize {
                    envelope: envelope.clone(),
                    user_metadata: user_metadata.clone(),
                })
                .await;
        }
        for sender in node_senders {
            drop(sender);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }
        let succeeded = total_success.load(Ordering::SeqCst);
        if succeeded < k {
            Err(CoreError::InsufficientDurability {
                succeeded,
                required: k,
            })
        } else {
            Ok(())
        }
    };

    let _ = completion_tx.send(outcome);
}

#[instrument(skip(node, rx, total_success))]
async fn node_worker(
    index: usize,
    mut node: Box<dyn NodeWriter>,
    mut rx: mpsc::Receiver<NodeMsg>,
    total_success: Arc<AtomicUsize>,
) {
    let mut failed = false;
    while let Some(msg) = rx.recv().await {
        if failed {
            continue;
        }
        match msg {
            NodeMsg::Shard(data) => {
                if let Err(e) = node.write(data).await {
                    warn!(node = index, error = %e, "node write failed");
                    node.close_with_error(e).await;
                    failed = true;
                }
            }
            NodeMsg::Finalize {
                envelope,
                user_metadata,
            } => {
                node.set_envelope(envelope);
                node.set_user_metadata(user_metadata);
                match node.close().await {
                    Ok(()) => {
                        total_success.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!(node = index, error = %e, "node close failed");
                    }
                }
                return;
            }
            NodeMsg::Abort(cause) => {
                node.close_with_error(cause).await;
                failed = true;
            }
        }
    }
}
