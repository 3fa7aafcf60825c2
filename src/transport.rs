use crate::segment::{HEADER_LEN, MAX_PAYLOAD_LEN};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

/// This is an abstraction for the unreliable datagram transport underneath the protocol,
///  introduced to facilitate mocking the I/O part away for testing. The transport may drop,
///  duplicate or reorder datagrams; the sender / receiver absorb all of that.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Best-effort: a failed or dropped send is logged, never surfaced - recovery is the
    ///  retransmission timers' job
    async fn send(&self, datagram: &[u8]);

    /// The next datagram, or `None` if nothing usable arrived this cycle. `None` is a
    ///  transient condition - callers keep listening, they never treat it as fatal.
    async fn recv(&self) -> Option<Vec<u8>>;
}

/// UDP implementation of the transport collaborator, bound to one local address and one peer
///  for its lifetime. `loss_probability` simulates a lossy network by discarding received
///  datagrams at random, which is what makes retransmission testable end to end.
pub struct UdpTransport {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    loss_probability: f64,
}

impl UdpTransport {
    pub async fn bind(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        loss_probability: f64,
    ) -> anyhow::Result<UdpTransport> {
        if !(0.0..=1.0).contains(&loss_probability) {
            anyhow::bail!("loss probability {} is not in [0, 1]", loss_probability);
        }

        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound datagram socket to {:?}, peer {:?}", socket.local_addr()?, peer_addr);

        Ok(UdpTransport {
            socket,
            peer_addr,
            loss_probability,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) {
        trace!("UDP socket: sending {} byte datagram to {:?}", datagram.len(), self.peer_addr);

        if let Err(e) = self.socket.send_to(datagram, self.peer_addr).await {
            error!("error sending UDP datagram to {:?}: {}", self.peer_addr, e);
        }
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        // anything bigger than a max-sized segment is garbage, extra room only so that
        //  truncation cannot make it look well-formed
        let mut buf = vec![0u8; 2 * (HEADER_LEN + MAX_PAYLOAD_LEN)];

        match self.socket.recv_from(&mut buf).await {
            Ok((num_read, from)) => {
                if self.loss_probability > 0.0 && rand::random::<f64>() < self.loss_probability {
                    debug!("simulating loss of a {} byte datagram from {:?}", num_read, from);
                    return None;
                }

                buf.truncate(num_read);
                Some(buf)
            }
            Err(e) => {
                error!("socket error: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_pair(loss_probability: f64) -> (UdpTransport, UdpTransport) {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        // a's socket has to exist before b can be aimed at it
        let a_socket = UdpSocket::bind(any).await.unwrap();
        let a_addr = a_socket.local_addr().unwrap();

        let b = UdpTransport::bind(any, a_addr, loss_probability).await.unwrap();
        let a = UdpTransport {
            socket: a_socket,
            peer_addr: b.local_addr(),
            loss_probability,
        };
        (a, b)
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (a, b) = bound_pair(0.0).await;

        a.send(&[1, 2, 3]).await;
        assert_eq!(b.recv().await, Some(vec![1, 2, 3]));

        b.send(&[4]).await;
        assert_eq!(a.recv().await, Some(vec![4]));
    }

    #[tokio::test]
    async fn test_simulated_loss() {
        let (a, b) = bound_pair(1.0).await;

        a.send(&[1, 2, 3]).await;
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_invalid_loss_probability() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(UdpTransport::bind(any, any, 1.5).await.is_err());
        assert!(UdpTransport::bind(any, any, -0.1).await.is_err());
    }
}
