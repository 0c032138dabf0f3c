//! Turns a connected TCP socket into a lazy, single-pass sequence of decoded
//! peer messages, injecting a distinct idle signal on read timeout so a
//! session can expire pending requests without tearing the connection down.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{error::*, peer::codec::{Message, PeerCodec}};

/// One item yielded by [`PeerStream`].
pub(crate) enum Event {
    Message(Message),
    /// The read timeout elapsed with no data; distinct from EOF so the
    /// session can expire its pending request without closing the socket.
    Idle,
    /// The sequence has ended for good: EOF, a reset, or a decode failure.
    /// Never a silent stop -- always delivered exactly once before the
    /// stream is dropped.
    End,
}

/// Wraps a [`Framed`] stream of a live peer connection.
pub(crate) struct PeerStream {
    framed: Framed<TcpStream, PeerCodec>,
    ended: bool,
    /// Per-message read timeout from the suspension-point model: a socket
    /// read that produces nothing within this window yields [`Event::Idle`]
    /// rather than blocking the session indefinitely.
    read_timeout: Duration,
}

impl PeerStream {
    pub fn new(socket: TcpStream, read_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(socket, PeerCodec),
            ended: false,
            read_timeout,
        }
    }

    /// Returns the next event: a decoded message, an idle timeout, or the
    /// terminal end signal. Once `End` has been yielded, every subsequent
    /// call returns `End` again rather than panicking or looping forever.
    pub async fn next(&mut self) -> Event {
        if self.ended {
            return Event::End;
        }

        match tokio::time::timeout(self.read_timeout, self.framed.next()).await {
            Ok(Some(Ok(msg))) => Event::Message(msg),
            Ok(Some(Err(e))) => {
                log::warn!("Peer stream decode error: {}", e);
                self.ended = true;
                Event::End
            }
            Ok(None) => {
                self.ended = true;
                Event::End
            }
            Err(_elapsed) => Event::Idle,
        }
    }

    /// Encodes and sends a message over the underlying connection.
    pub async fn write(&mut self, msg: Message) -> Result<()> {
        self.framed.send(msg).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::peer::codec::Message;
    use tokio_util::codec::Encoder;

    #[tokio::test]
    async fn test_end_on_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(listener.accept(), client);
        let (server_socket, _) = accepted.unwrap();
        let client_socket = client.unwrap();
        drop(client_socket);

        let mut stream = PeerStream::new(server_socket, Duration::from_secs(15));
        match stream.next().await {
            Event::End => {}
            _ => panic!("expected End on EOF"),
        }
        // once ended, stays ended
        match stream.next().await {
            Event::End => {}
            _ => panic!("expected End to persist"),
        }
    }

    #[tokio::test]
    async fn test_yields_decoded_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(listener.accept(), client);
        let (server_socket, _) = accepted.unwrap();
        let mut client_socket = client.unwrap();

        let mut buf = bytes::BytesMut::new();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();
        use tokio::io::AsyncWriteExt;
        client_socket.write_all(&buf).await.unwrap();

        let mut stream = PeerStream::new(server_socket, Duration::from_secs(15));
        match stream.next().await {
            Event::Message(Message::Unchoke) => {}
            _ => panic!("expected Unchoke message"),
        }
    }
}
