//! Bridge between libFLAC's synchronous read callback and pushed input.
//!
//! The codec thread owns a [`ReadBridge`]. When libFLAC asks for `n` bytes,
//! the bridge sends a [`Demand`] carrying a one-shot [`SuspensionToken`] and
//! blocks until the token is resolved. The async side owns the matching
//! [`BridgeServer`], which holds the queued input and resolves the token as
//! soon as enough bytes are available, or with an end-of-input marker once
//! the producer closed the input.
//!
//! ```text
//!  codec thread                      async sink
//!  ReadBridge::read(n) ──Demand──▶  BridgeServer::park()
//!        ▲                                │ push() / end_input()
//!        └──────── Refill (one-shot) ◀────┘
//! ```
//!
//! The demand channel has capacity one and the codec thread waits on each
//! token before issuing the next demand, so at most one token is ever
//! outstanding. [`BridgeServer::park`] still refuses a second token.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{chunk_queue::ChunkQueue, error::FlacError};

/// Demand threshold used before libFLAC issued its first read.
pub(crate) const MIN_DEMAND: usize = 4 * 1024;

/// Payload resolving a parked read.
#[derive(Debug)]
pub(crate) enum Refill {
    Bytes(Bytes),
    EndOfInput,
}

/// One-shot handle for a parked read. Resolving consumes it.
#[derive(Debug)]
pub(crate) struct SuspensionToken(oneshot::Sender<Refill>);

impl SuspensionToken {
    fn resolve(self, refill: Refill) {
        // The codec side may already be gone (destroyed session).
        let _ = self.0.send(refill);
    }
}

/// A read request issued by the codec.
#[derive(Debug)]
pub(crate) struct Demand {
    pub wanted: usize,
    token: SuspensionToken,
}

impl Demand {
    pub fn new(wanted: usize) -> (Self, oneshot::Receiver<Refill>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                wanted,
                token: SuspensionToken(tx),
            },
            rx,
        )
    }
}

/// Result of [`ReadBridge::read`], mapped onto libFLAC read statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Bytes(usize),
    EndOfStream,
    Abort,
}

/// Builds both halves of a bridge.
pub(crate) fn read_bridge(prefetch_factor: usize) -> (ReadBridge, BridgeServer) {
    let (demand_tx, demand_rx) = mpsc::channel(1);
    (
        ReadBridge {
            demand_tx,
            ended: false,
            consumed: 0,
        },
        BridgeServer {
            demand_rx,
            queue: ChunkQueue::new(),
            parked: None,
            threshold: MIN_DEMAND,
            prefetch_factor: prefetch_factor.max(1),
            input_ended: false,
        },
    )
}

/// Codec-thread half. Every call may block the calling thread.
#[derive(Debug)]
pub(crate) struct ReadBridge {
    demand_tx: mpsc::Sender<Demand>,
    ended: bool,
    consumed: u64,
}

impl ReadBridge {
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.ended {
            return ReadOutcome::EndOfStream;
        }
        if buf.is_empty() {
            return ReadOutcome::Bytes(0);
        }

        let (demand, token) = Demand::new(buf.len());
        if self.demand_tx.blocking_send(demand).is_err() {
            return ReadOutcome::Abort;
        }

        match token.blocking_recv() {
            Ok(Refill::Bytes(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                self.consumed += n as u64;
                ReadOutcome::Bytes(n)
            }
            Ok(Refill::EndOfInput) => {
                self.ended = true;
                ReadOutcome::EndOfStream
            }
            Err(_) => ReadOutcome::Abort,
        }
    }

    /// True once the producer signalled end of input and everything queued
    /// before it was delivered.
    pub fn is_eof(&self) -> bool {
        self.ended
    }

    /// Bytes handed to the codec so far.
    pub fn position(&self) -> u64 {
        self.consumed
    }
}

/// Async half: owns the queued input and the parked token.
#[derive(Debug)]
pub(crate) struct BridgeServer {
    demand_rx: mpsc::Receiver<Demand>,
    queue: ChunkQueue,
    parked: Option<Demand>,
    threshold: usize,
    prefetch_factor: usize,
    input_ended: bool,
}

impl BridgeServer {
    /// Queues input and resolves the parked token if it is now satisfied.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), FlacError> {
        if self.input_ended {
            return Err(FlacError::Protocol(
                "input written after end of input was signalled".into(),
            ));
        }
        self.queue.push(chunk);
        self.try_resolve();
        Ok(())
    }

    /// Marks the input as complete. Parked and future demands are answered
    /// with whatever is queued, then with end-of-input.
    pub fn end_input(&mut self) {
        self.input_ended = true;
        self.try_resolve();
    }

    /// Parks a demand, resolving it right away when the queue already
    /// satisfies it.
    pub fn park(&mut self, demand: Demand) -> Result<(), FlacError> {
        if self.parked.is_some() {
            return Err(FlacError::Protocol(
                "codec issued a read while a previous read is still parked".into(),
            ));
        }
        self.threshold = demand.wanted;
        self.parked = Some(demand);
        self.try_resolve();
        Ok(())
    }

    /// Waits for the next demand. `None` once the codec thread dropped its half.
    pub async fn next_demand(&mut self) -> Option<Demand> {
        self.demand_rx.recv().await
    }

    /// Takes a demand that is already waiting, without suspending.
    pub fn try_next_demand(&mut self) -> Result<Demand, mpsc::error::TryRecvError> {
        self.demand_rx.try_recv()
    }

    /// Almost-empty policy: more input is wanted while fewer than
    /// `prefetch_factor × threshold` bytes are queued.
    pub fn wants_input(&self) -> bool {
        !self.input_ended
            && self
                .queue
                .is_below(self.threshold.saturating_mul(self.prefetch_factor))
    }

    pub fn has_parked(&self) -> bool {
        self.parked.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Drops the parked token and the queued input. The codec side observes
    /// an aborted read.
    pub fn release(&mut self) {
        self.parked = None;
        self.queue.clear();
        self.demand_rx.close();
    }

    fn try_resolve(&mut self) -> bool {
        let Some(demand) = self.parked.take() else {
            return false;
        };

        if !self.queue.is_below(demand.wanted) || (self.input_ended && !self.queue.is_empty()) {
            let drained = self.queue.drain(demand.wanted);
            demand.token.resolve(Refill::Bytes(drained.bytes));
            true
        } else if self.input_ended {
            demand.token.resolve(Refill::EndOfInput);
            true
        } else {
            self.parked = Some(demand);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_reader(
        mut bridge: ReadBridge,
        sizes: Vec<usize>,
    ) -> std::thread::JoinHandle<Vec<(ReadOutcome, Vec<u8>)>> {
        std::thread::spawn(move || {
            sizes
                .into_iter()
                .map(|size| {
                    let mut buf = vec![0u8; size];
                    let outcome = bridge.read(&mut buf);
                    let n = match outcome {
                        ReadOutcome::Bytes(n) => n,
                        _ => 0,
                    };
                    buf.truncate(n);
                    (outcome, buf)
                })
                .collect()
        })
    }

    #[tokio::test]
    async fn resolves_synchronously_when_queue_is_sufficient() {
        let (bridge, mut server) = read_bridge(2);
        server.push(Bytes::from_static(b"0123456789")).unwrap();
        let reader = spawn_reader(bridge, vec![4]);

        let demand = server.next_demand().await.unwrap();
        server.park(demand).unwrap();
        assert!(!server.has_parked());
        assert_eq!(server.queued(), 6);

        let reads = reader.join().unwrap();
        assert_eq!(reads, vec![(ReadOutcome::Bytes(4), b"0123".to_vec())]);
    }

    #[tokio::test]
    async fn parks_until_threshold_is_reached() {
        let (bridge, mut server) = read_bridge(2);
        let reader = spawn_reader(bridge, vec![8]);

        let demand = server.next_demand().await.unwrap();
        server.park(demand).unwrap();
        assert!(server.has_parked());
        assert_eq!(server.threshold(), 8);

        server.push(Bytes::from_static(b"abc")).unwrap();
        assert!(server.has_parked());
        assert!(server.wants_input());

        server.push(Bytes::from_static(b"defghi")).unwrap();
        assert!(!server.has_parked());
        assert_eq!(server.queued(), 1);

        let reads = reader.join().unwrap();
        assert_eq!(reads, vec![(ReadOutcome::Bytes(8), b"abcdefgh".to_vec())]);
    }

    #[tokio::test]
    async fn end_of_input_flushes_then_signals_eof() {
        let (bridge, mut server) = read_bridge(2);
        let reader = spawn_reader(bridge, vec![8, 8, 8]);

        let demand = server.next_demand().await.unwrap();
        server.park(demand).unwrap();
        server.push(Bytes::from_static(b"xyz")).unwrap();
        server.end_input();
        assert!(!server.wants_input());

        let demand = server.next_demand().await.unwrap();
        server.park(demand).unwrap();
        assert!(!server.has_parked());

        // The third read never reaches the server.
        let reads = reader.join().unwrap();
        assert_eq!(
            reads,
            vec![
                (ReadOutcome::Bytes(3), b"xyz".to_vec()),
                (ReadOutcome::EndOfStream, Vec::new()),
                (ReadOutcome::EndOfStream, Vec::new()),
            ]
        );
        assert!(server.next_demand().await.is_none());
    }

    #[tokio::test]
    async fn second_parked_read_is_a_protocol_violation() {
        let (_bridge, mut server) = read_bridge(2);
        let (first, _first_rx) = Demand::new(16);
        let (second, _second_rx) = Demand::new(16);
        server.park(first).unwrap();
        assert!(matches!(server.park(second), Err(FlacError::Protocol(_))));
    }

    #[tokio::test]
    async fn write_after_end_is_rejected() {
        let (_bridge, mut server) = read_bridge(2);
        server.end_input();
        assert!(matches!(
            server.push(Bytes::from_static(b"late")),
            Err(FlacError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn released_server_aborts_the_reader() {
        let (bridge, mut server) = read_bridge(2);
        let reader = spawn_reader(bridge, vec![8, 8]);

        let demand = server.next_demand().await.unwrap();
        server.park(demand).unwrap();
        server.release();

        let reads = reader.join().unwrap();
        assert_eq!(reads[0].0, ReadOutcome::Abort);
        assert_eq!(reads[1].0, ReadOutcome::Abort);
    }

    #[test]
    fn prefetch_policy_scales_threshold() {
        let (_bridge, mut server) = read_bridge(3);
        let (demand, _rx) = Demand::new(10);
        server.park(demand).unwrap();
        server.push(Bytes::from(vec![0u8; 9])).unwrap();
        assert!(server.wants_input());
        server.push(Bytes::from(vec![0u8; 1])).unwrap();
        // Resolved with 10 bytes, queue empty again.
        assert_eq!(server.queued(), 0);
        server.push(Bytes::from(vec![0u8; 29])).unwrap();
        assert!(server.wants_input());
        server.push(Bytes::from(vec![0u8; 1])).unwrap();
        assert!(!server.wants_input());
    }
}
