use crate::config::ArqConfig;
use crate::segment::{Segment, SegmentKind, HEADER_LEN};
use crate::transport::{DatagramTransport, UdpTransport};
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

struct ReceiverInner {
    config: Arc<ArqConfig>,
    transport: Arc<dyn DatagramTransport>,

    /// the delivery cursor: lowest sequence not yet handed to the application. Everything
    ///  below has been delivered, everything at or above is buffered or still missing.
    expected_sequence: u32,

    /// out-of-order arrivals, keyed by sequence - only ever holds sequences in
    ///  `[expected_sequence, expected_sequence + receive_window_size)`
    reorder_buffer: BTreeMap<u32, Vec<u8>>,

    /// `None` after shutdown, which closes the delivery queue
    delivery: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ReceiverInner {
    /// Sends the cumulative acknowledgment: the highest sequence received in order. While
    ///  nothing has arrived in order yet there is nothing to acknowledge - the sender's
    ///  timers cover that window.
    async fn send_ack(&self) {
        let Some(highest_in_order) = self.expected_sequence.checked_sub(1) else {
            trace!("no contiguous prefix received yet - nothing to acknowledge");
            return;
        };

        let segment = Segment::ack(highest_in_order);
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        segment.ser(&mut buf);

        trace!("sending {}", segment);
        self.transport.send(&buf).await;
    }
}

/// The receiving endpoint: validates arriving DATA segments against the receive window,
///  buffers out-of-order arrivals, acknowledges cumulatively and hands the contiguous prefix
///  to the application, one chunk per [`Receiver::recv`] call.
pub struct Receiver {
    inner: Arc<RwLock<ReceiverInner>>,
    delivered: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    recv_loop_handle: Option<JoinHandle<()>>,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_loop_handle.take() {
            handle.abort();
        }
    }
}

impl Receiver {
    pub fn new(transport: Arc<dyn DatagramTransport>, config: Arc<ArqConfig>) -> anyhow::Result<Receiver> {
        config.validate()?;

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let inner = ReceiverInner {
            config,
            transport,
            expected_sequence: 0,
            reorder_buffer: BTreeMap::default(),
            delivery: Some(delivery_tx),
        };

        Ok(Receiver {
            inner: Arc::new(RwLock::new(inner)),
            delivered: Mutex::new(delivery_rx),
            recv_loop_handle: None,
        })
    }

    /// Bind a UDP transport to `local_addr`, acknowledging towards `peer_addr`, and start
    ///  the receive loop.
    pub async fn bind(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        loss_probability: f64,
        config: Arc<ArqConfig>,
    ) -> anyhow::Result<Receiver> {
        let transport = UdpTransport::bind(local_addr, peer_addr, loss_probability).await?;
        let mut receiver = Receiver::new(Arc::new(transport), config)?;
        receiver.spawn_recv_loop();
        Ok(receiver)
    }

    pub fn spawn_recv_loop(&mut self) {
        if self.recv_loop_handle.is_some() {
            warn!("receive loop already spawned");
            return;
        }
        self.recv_loop_handle = Some(tokio::spawn(Self::recv_loop(self.inner.clone())));
    }

    /// The next chunk of application data, in sending order, exactly once. Waits until a
    ///  chunk is available; `None` only after [`Receiver::shutdown`] with the queue drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.delivered.lock().await.recv().await
    }

    /// Stops the receive loop and closes the delivery queue. Chunks already delivered to the
    ///  queue can still be drained with [`Receiver::recv`]; buffered out-of-order segments
    ///  are discarded.
    pub async fn shutdown(&mut self) {
        debug!("shutting down receiver");

        if let Some(handle) = self.recv_loop_handle.take() {
            handle.abort();
        }

        let mut inner = self.inner.write().await;
        inner.reorder_buffer.clear();
        inner.delivery = None;
    }

    /// One arriving DATA segment: window check, buffer, reassemble the contiguous prefix
    ///  into the delivery queue, acknowledge.
    async fn on_data(inner_arc: &Arc<RwLock<ReceiverInner>>, sequence: u32, payload: Vec<u8>) {
        let mut inner = inner_arc.write().await;

        if sequence < inner.expected_sequence {
            // duplicate of already-delivered data: the retransmission that carried it means
            //  our acknowledgment got lost, so repeat it, but do not deliver twice
            debug!(
                "segment #{} was already delivered (expecting #{}) - re-acknowledging",
                sequence, inner.expected_sequence
            );
            inner.send_ack().await;
            return;
        }

        let window_end = inner
            .expected_sequence
            .saturating_add(inner.config.receive_window_size as u32);
        if sequence >= window_end {
            debug!(
                "segment #{} is beyond the receive window [{}, {}) - discarding unacknowledged",
                sequence, inner.expected_sequence, window_end
            );
            return;
        }

        // idempotent: a re-received segment overwrites itself with identical content
        inner.reorder_buffer.insert(sequence, payload);

        // hand the contiguous prefix to the application, advancing the cursor
        loop {
            let cursor = inner.expected_sequence;
            let Some(chunk) = inner.reorder_buffer.remove(&cursor) else {
                break;
            };
            trace!("delivering chunk #{} ({} bytes)", cursor, chunk.len());
            match &inner.delivery {
                Some(delivery) => {
                    if delivery.send(chunk).is_err() {
                        debug!("delivery queue is gone - discarding chunk");
                    }
                }
                None => debug!("delivery queue closed by shutdown - discarding chunk"),
            }
            inner.expected_sequence += 1;
        }

        inner.send_ack().await;
    }

    /// Background loop consuming the transport: decodes incoming datagrams and feeds DATA
    ///  segments into the window. Runs until aborted.
    async fn recv_loop(inner: Arc<RwLock<ReceiverInner>>) {
        info!("starting receive loop");

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
                    SegmentKind::Data => Self::on_data(&inner, segment.sequence, segment.payload).await,
                    SegmentKind::Ack => {
                        debug!("ACK segment #{} arrived at the receiving side - ignoring", segment.sequence)
                    }
                }
            }
            .instrument(span)
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockDatagramTransport;
    use mockall::Sequence;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config(receive_window_size: usize) -> Arc<ArqConfig> {
        Arc::new(ArqConfig {
            receive_window_size,
            ..ArqConfig::default()
        })
    }

    fn expect_acks_in_order(transport: &mut MockDatagramTransport, ack_sequences: Vec<u32>) {
        let mut sequence = Sequence::new();
        for ack in ack_sequences {
            let expected = vec![0x41, (ack >> 24) as u8, (ack >> 16) as u8, (ack >> 8) as u8, ack as u8];
            transport
                .expect_send()
                .once()
                .in_sequence(&mut sequence)
                .withf(move |datagram| datagram == expected.as_slice())
                .return_const(());
        }
    }

    async fn drain_delivered(receiver: &Receiver) -> Vec<Vec<u8>> {
        let mut delivered = receiver.delivered.lock().await;
        let mut chunks = Vec::new();
        loop {
            match delivered.try_recv() {
                Ok(chunk) => chunks.push(chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return chunks,
            }
        }
    }

    #[rstest]
    #[case::in_order(
        5,
        vec![(0, vec![10]), (1, vec![11]), (2, vec![12])],
        vec![0, 1, 2],
        vec![vec![10], vec![11], vec![12]],
        3,
        vec![])]
    #[case::reverse_order(
        5,
        vec![(1, vec![11]), (0, vec![10])],
        vec![1], // nothing to acknowledge until the gap at 0 is filled, then one cumulative ACK
        vec![vec![10], vec![11]],
        2,
        vec![])]
    #[case::gap_stalls_delivery(
        5,
        vec![(0, vec![10]), (2, vec![12]), (3, vec![13])],
        vec![0, 0, 0], // the cumulative ACK does not move past the gap at 1
        vec![vec![10]],
        1,
        vec![2, 3])]
    #[case::gap_filled(
        5,
        vec![(0, vec![10]), (2, vec![12]), (1, vec![11])],
        vec![0, 0, 2],
        vec![vec![10], vec![11], vec![12]],
        3,
        vec![])]
    #[case::beyond_window_discarded_silently(
        5,
        vec![(10, vec![99])],
        vec![], // no ACK for an out-of-window segment
        vec![],
        0,
        vec![])]
    #[case::window_edges(
        5,
        vec![(4, vec![14]), (5, vec![15])],
        vec![], // 4 is the last acceptable sequence, 5 is out of window; neither is in order
        vec![],
        0,
        vec![4])]
    #[case::duplicate_in_window(
        5,
        vec![(1, vec![11]), (1, vec![11])],
        vec![],
        vec![],
        0,
        vec![1])]
    #[case::duplicate_below_window_reacked(
        5,
        vec![(0, vec![10]), (0, vec![10])],
        vec![0, 0], // second arrival is not delivered again but repeats the ACK
        vec![vec![10]],
        1,
        vec![])]
    fn test_on_data(
        #[case] receive_window_size: usize,
        #[case] arrivals: Vec<(u32, Vec<u8>)>,
        #[case] expected_acks: Vec<u32>,
        #[case] expected_chunks: Vec<Vec<u8>>,
        #[case] expected_cursor: u32,
        #[case] expected_buffered: Vec<u32>,
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut transport = MockDatagramTransport::new();
            expect_acks_in_order(&mut transport, expected_acks);

            let receiver = Receiver::new(Arc::new(transport), test_config(receive_window_size)).unwrap();

            for (sequence, payload) in arrivals {
                Receiver::on_data(&receiver.inner, sequence, payload).await;
            }

            assert_eq!(drain_delivered(&receiver).await, expected_chunks);

            let inner = receiver.inner.read().await;
            assert_eq!(inner.expected_sequence, expected_cursor);
            let buffered = inner.reorder_buffer.keys().cloned().collect::<Vec<_>>();
            assert_eq!(buffered, expected_buffered);
        });
    }

    #[rstest]
    fn test_window_slides_with_cursor() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockDatagramTransport::new();
            expect_acks_in_order(&mut transport, vec![0, 1]);

            let receiver = Receiver::new(Arc::new(transport), test_config(2)).unwrap();

            // window [0, 2): sequence 2 is unacceptable
            Receiver::on_data(&receiver.inner, 2, vec![12]).await;
            // delivering 0 and 1 slides the window to [2, 4)
            Receiver::on_data(&receiver.inner, 0, vec![10]).await;
            Receiver::on_data(&receiver.inner, 1, vec![11]).await;

            assert_eq!(
                drain_delivered(&receiver).await,
                vec![vec![10], vec![11]]
            );
            assert_eq!(receiver.inner.read().await.expected_sequence, 2);
        });
    }

    #[rstest]
    fn test_recv_blocks_until_delivery() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockDatagramTransport::new();
            expect_acks_in_order(&mut transport, vec![0]);

            let receiver = Arc::new(Receiver::new(Arc::new(transport), test_config(5)).unwrap());

            let receiver_clone = receiver.clone();
            let pending_recv = tokio::spawn(async move { receiver_clone.recv().await });
            tokio::task::yield_now().await;
            assert!(!pending_recv.is_finished());

            Receiver::on_data(&receiver.inner, 0, vec![10]).await;
            assert_eq!(pending_recv.await.unwrap(), Some(vec![10]));
        });
    }

    #[rstest]
    fn test_shutdown_closes_delivery_queue() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockDatagramTransport::new();
            expect_acks_in_order(&mut transport, vec![0]);

            let mut receiver = Receiver::new(Arc::new(transport), test_config(5)).unwrap();
            Receiver::on_data(&receiver.inner, 0, vec![10]).await;

            receiver.shutdown().await;

            // chunks delivered before shutdown can still be drained, then the queue ends
            assert_eq!(receiver.recv().await, Some(vec![10]));
            assert_eq!(receiver.recv().await, None);
        });
    }
}
