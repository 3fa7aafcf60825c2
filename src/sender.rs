use crate::config::ArqConfig;
use crate::segment::{Segment, SegmentKind, HEADER_LEN};
use crate::transport::{DatagramTransport, UdpTransport};
use anyhow::bail;
use bytes::BytesMut;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// One unacknowledged segment: the encoded datagram, kept verbatim for retransmission, and
///  the handle of the timer task guarding it.
struct InFlight {
    datagram: Vec<u8>,
    retransmit_handle: JoinHandle<()>,
}

struct SenderInner {
    config: Arc<ArqConfig>,
    transport: Arc<dyn DatagramTransport>,

    next_sequence: u32,

    /// transmitted but not yet acknowledged, at most `send_window_size` entries
    outstanding: BTreeMap<u32, InFlight>,

    /// chunks submitted while the window was full, waiting for capacity in FIFO order
    pending: VecDeque<Vec<u8>>,
}

impl SenderInner {
    fn has_window_capacity(&self) -> bool {
        self.outstanding.len() < self.config.send_window_size
    }
}

/// The sending endpoint: splits application data into segments, keeps each in flight until a
///  cumulative acknowledgment covers it, and retransmits on timeout. All state is behind a
///  single lock shared by the application caller, the acknowledgment loop and the timer tasks.
pub struct Sender {
    config: Arc<ArqConfig>,
    inner: Arc<RwLock<SenderInner>>,
    recv_loop_handle: Option<JoinHandle<()>>,
}

impl Drop for Sender {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_loop_handle.take() {
            handle.abort();
        }
    }
}

impl Sender {
    pub fn new(transport: Arc<dyn DatagramTransport>, config: Arc<ArqConfig>) -> anyhow::Result<Sender> {
        config.validate()?;

        let inner = SenderInner {
            config: config.clone(),
            transport,
            next_sequence: 0,
            outstanding: BTreeMap::default(),
            pending: VecDeque::default(),
        };

        Ok(Sender {
            config,
            inner: Arc::new(RwLock::new(inner)),
            recv_loop_handle: None,
        })
    }

    /// Bind a UDP transport to `local_addr`, aimed at `peer_addr`, and start the
    ///  acknowledgment loop.
    pub async fn bind(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        loss_probability: f64,
        config: Arc<ArqConfig>,
    ) -> anyhow::Result<Sender> {
        let transport = UdpTransport::bind(local_addr, peer_addr, loss_probability).await?;
        let mut sender = Sender::new(Arc::new(transport), config)?;
        sender.spawn_recv_loop();
        Ok(sender)
    }

    pub fn spawn_recv_loop(&mut self) {
        if self.recv_loop_handle.is_some() {
            warn!("acknowledgment loop already spawned");
            return;
        }
        self.recv_loop_handle = Some(tokio::spawn(Self::recv_loop(self.inner.clone())));
    }

    /// Splits `data` into chunks of at most the configured segment payload size and submits
    ///  them in order. Chunks that do not fit the send window are queued, never dropped -
    ///  they go out as acknowledgments free up capacity.
    ///
    /// The only error is exhaustion of the u32 sequence space (wraparound is out of scope).
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;

        for chunk in data.chunks(self.config.max_segment_payload) {
            // a non-empty pending queue means the window filled up earlier; queue behind it
            //  to preserve submission order
            if !inner.has_window_capacity() || !inner.pending.is_empty() {
                trace!("send window full - queueing {} byte chunk", chunk.len());
                inner.pending.push_back(chunk.to_vec());
            } else {
                Self::transmit(&self.inner, &mut inner, chunk.to_vec()).await?;
            }
        }
        Ok(())
    }

    /// number of unacknowledged segments currently in flight
    pub async fn in_flight(&self) -> usize {
        self.inner.read().await.outstanding.len()
    }

    /// number of chunks queued behind a full window
    pub async fn queued(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    /// Stops the acknowledgment loop and all retransmission timers and discards buffered
    ///  state. Queued chunks that were never transmitted are lost - this is teardown, not
    ///  a graceful flush.
    pub async fn shutdown(&mut self) {
        debug!("shutting down sender");

        if let Some(handle) = self.recv_loop_handle.take() {
            handle.abort();
        }

        let mut inner = self.inner.write().await;
        for (_, entry) in std::mem::take(&mut inner.outstanding) {
            entry.retransmit_handle.abort();
        }
        inner.pending.clear();
    }

    /// Assigns the next sequence number, transmits the chunk as a DATA segment and arms its
    ///  retransmission timer. Caller must have checked window capacity.
    async fn transmit(
        inner_arc: &Arc<RwLock<SenderInner>>,
        inner: &mut SenderInner,
        chunk: Vec<u8>,
    ) -> anyhow::Result<()> {
        debug_assert!(inner.has_window_capacity());

        let sequence = inner.next_sequence;
        inner.next_sequence = match sequence.checked_add(1) {
            Some(next) => next,
            None => bail!("sequence number space exhausted - wraparound is not supported"),
        };

        let segment = Segment::data(sequence, chunk);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + segment.payload.len());
        segment.ser(&mut buf);
        let datagram = buf.to_vec();

        debug!("transmitting {}", segment);
        inner.transport.send(&datagram).await;
        //NB: a dropped send is recovered by the retransmission timer, not here

        let retransmit_handle = tokio::spawn(Self::retransmit_loop(
            Arc::downgrade(inner_arc),
            inner.config.retransmit_timeout,
            sequence,
        ));

        inner.outstanding.insert(
            sequence,
            InFlight {
                datagram,
                retransmit_handle,
            },
        );
        Ok(())
    }

    /// Timer task for one segment: retransmit the identical datagram every timeout interval
    ///  for as long as the segment is outstanding. The task holds only a weak reference, so
    ///  a dropped sender ends it even without an explicit shutdown.
    async fn retransmit_loop(inner: Weak<RwLock<SenderInner>>, timeout: Duration, sequence: u32) {
        loop {
            time::sleep(timeout).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let inner = inner.read().await;

            let Some(entry) = inner.outstanding.get(&sequence) else {
                // acknowledged in the meantime - the purge races with its abort of this task
                return;
            };

            debug!("segment #{} unacknowledged after {:?} - retransmitting", sequence, timeout);
            inner.transport.send(&entry.datagram).await;
        }
    }

    /// Cumulative acknowledgment: retire every outstanding segment at or below the
    ///  acknowledged sequence, then move queued chunks into the freed window capacity.
    async fn on_ack(inner_arc: &Arc<RwLock<SenderInner>>, ack_sequence: u32) {
        let mut inner = inner_arc.write().await;

        while let Some((&sequence, _)) = inner.outstanding.first_key_value() {
            if sequence > ack_sequence {
                break;
            }
            if let Some(entry) = inner.outstanding.remove(&sequence) {
                entry.retransmit_handle.abort();
                trace!("segment #{} acknowledged (cumulative ACK {})", sequence, ack_sequence);
            }
        }

        while inner.has_window_capacity() {
            let Some(chunk) = inner.pending.pop_front() else {
                break;
            };
            if let Err(e) = Self::transmit(inner_arc, &mut inner, chunk).await {
                warn!("dropping queued chunk: {}", e);
                break;
            }
        }
    }

    /// Background loop consuming the transport: decodes incoming datagrams and feeds ACKs
    ///  into the window. Runs until aborted.
    async fn recv_loop(inner: Arc<RwLock<SenderInner>>) {
        info!("starting acknowledgment loop");

        let transport = inner.read().await.transport.clone();

        loop {
            let Some(datagram) = transport.recv().await else {
                continue;
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            async {
                let segment = match Segment::deser(&datagram) {
                    Ok(segment) => segment,
                    Err(e) => {
                        warn!("received malformed datagram - dropping: {}", e);
                        return;
                    }
                };
                trace!("received {}", segment);

                match segment.kind {
                    SegmentKind::Ack => Self::on_ack(&inner, segment.sequence).await,
                    SegmentKind::Data => {
                        debug!("DATA segment #{} arrived at the sending side - ignoring", segment.sequence)
                    }
                }
            }
            .instrument(span)
            .await;
        }
    }
}
