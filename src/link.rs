use std::collections::VecDeque;
use std::time::Duration;

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{Fuse, FutureExt},
    select,
    sink::SinkExt,
    stream::StreamExt,
};

use futures_timer::Delay;

use log::{debug, trace, warn};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::constants::*;
use crate::error::*;
use crate::frame::{FrameCodec, WireCommand, WireEvent};
use crate::message::Message;

/// Link-level ARQ parameters. The defaults are the protocol values; tests
/// shrink them to keep retry scenarios fast.
#[derive(Clone, Copy, Debug)]
pub struct LinkOptions {
    /// How long to wait for a wire ACK before retransmitting.
    pub retry_timeout: Duration,
    /// Total transmissions of one command before it fails.
    pub max_attempts: u8,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            retry_timeout: RETRY_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl LinkOptions {
    /// How long a caller should wait for a reply tally before giving up:
    /// twice the full link retry budget.
    pub fn reply_timeout(&self) -> Duration {
        self.retry_timeout * 2 * (self.max_attempts as u32 + 1)
    }
}

enum LinkRequest {
    Send {
        message: Message,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        listener: UnboundedSender<Message>,
    },
}

/// Handle to the link task. The task owns the transport, the frame codec
/// and the pending-command queue; everything reaches the wire through it,
/// which is what serialises transmission and keeps one command in flight.
#[derive(Clone)]
pub struct Link {
    sender: UnboundedSender<LinkRequest>,
}

struct Pending {
    message: Message,
    attempts: u8,
    responder: oneshot::Sender<Result<(), Error>>,
}

impl Link {
    /// Start the link task over an open transport.
    pub fn new(
        handle: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
        options: LinkOptions,
    ) -> Link {
        let (sender, receiver) = unbounded();
        tokio::spawn(event_loop(
            options,
            receiver,
            Framed::new(handle, FrameCodec::new()),
        ));
        Link { sender }
    }

    /// Queue a command for transmission without waiting for its outcome.
    /// Commands from one caller go on the wire in the order enqueued. The
    /// returned channel reports wire delivery (ACK) or failure.
    pub fn enqueue(&self, message: Message) -> oneshot::Receiver<Result<(), Error>> {
        let (responder, receiver) = oneshot::channel();
        if let Err(rejected) = self.sender.unbounded_send(LinkRequest::Send {
            message,
            responder,
        }) {
            if let LinkRequest::Send { responder, .. } = rejected.into_inner() {
                let _ = responder.send(Err(Error::Disconnected));
            }
        }
        receiver
    }

    /// Queue a command and wait until the router ACKs it on the wire.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.enqueue(message).await?
    }

    /// Receive every message the router sends, solicited or not. The
    /// stream ends when the transport drops.
    pub fn subscribe(&self) -> Result<UnboundedReceiver<Message>, Error> {
        let (listener, receiver) = unbounded();
        self.sender
            .unbounded_send(LinkRequest::Subscribe { listener })
            .map_err(|_| Error::Disconnected)?;
        Ok(receiver)
    }
}

async fn event_loop<T>(
    options: LinkOptions,
    mut requests: UnboundedReceiver<LinkRequest>,
    mut framed: Framed<T, FrameCodec>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut listeners: Vec<UnboundedSender<Message>> = Vec::new();
    let mut queue: VecDeque<Pending> = VecDeque::new();
    let mut in_flight: Option<Pending> = None;
    let mut retry: Fuse<Delay> = Fuse::terminated();

    loop {
        select! {
            event = framed.next().fuse() => match event {
                Some(Ok(WireEvent::Frame(frame))) => {
                    trace!("Received frame {:02x?}", frame);
                    // Data frames are ACKed on the wire before anything
                    // else looks at them.
                    if framed.send(WireCommand::Ack).await.is_err() {
                        break;
                    }
                    match Message::from_frame(&frame) {
                        Ok(message) => {
                            debug!("Received {:?}", message);
                            deliver(&mut listeners, message);
                        }
                        Err(e) => warn!("Undecodable frame {:02x?}: {}", frame, e),
                    }
                }
                Some(Ok(WireEvent::Ack)) => match in_flight.take() {
                    Some(pending) => {
                        trace!("Delivered after {} attempt(s)", pending.attempts);
                        let _ = pending.responder.send(Ok(()));
                        retry = Fuse::terminated();
                        if !transmit_next(&options, &mut framed, &mut queue, &mut in_flight, &mut retry).await {
                            break;
                        }
                    }
                    None => debug!("Spurious ACK"),
                },
                Some(Ok(WireEvent::Nak)) => {
                    debug!("Router NAKed the in-flight command");
                    if !retransmit(&options, &mut framed, &mut queue, &mut in_flight, &mut retry).await {
                        break;
                    }
                }
                Some(Ok(WireEvent::Corrupt(e))) => {
                    warn!("Damaged frame ({}), sending NAK", e);
                    if framed.send(WireCommand::Nak).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Link read error: {}", e);
                    break;
                }
                None => {
                    debug!("Transport closed");
                    break;
                }
            },
            request = requests.next() => match request {
                Some(LinkRequest::Send { message, responder }) => {
                    queue.push_back(Pending { message, attempts: 0, responder });
                    if in_flight.is_none()
                        && !transmit_next(&options, &mut framed, &mut queue, &mut in_flight, &mut retry).await
                    {
                        break;
                    }
                }
                Some(LinkRequest::Subscribe { listener }) => listeners.push(listener),
                None => break, // Every handle dropped.
            },
            _ = &mut retry => {
                debug!("No ACK within {:?}", options.retry_timeout);
                if !retransmit(&options, &mut framed, &mut queue, &mut in_flight, &mut retry).await {
                    break;
                }
            }
        }
    }

    // Transport gone. Everything pending fails, and dropping the listeners
    // ends every subscriber stream.
    if let Some(pending) = in_flight.take() {
        let _ = pending.responder.send(Err(Error::Disconnected));
    }
    while let Some(pending) = queue.pop_front() {
        let _ = pending.responder.send(Err(Error::Disconnected));
    }
}

fn deliver(listeners: &mut Vec<UnboundedSender<Message>>, message: Message) {
    listeners.retain(|listener| listener.unbounded_send(message.clone()).is_ok());
}

/// Puts the head of the queue on the wire, if any. Returns false when the
/// transport is gone.
async fn transmit_next<T>(
    options: &LinkOptions,
    framed: &mut Framed<T, FrameCodec>,
    queue: &mut VecDeque<Pending>,
    in_flight: &mut Option<Pending>,
    retry: &mut Fuse<Delay>,
) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(mut pending) = queue.pop_front() {
        pending.attempts += 1;
        debug!("Sending {:?} (attempt {})", pending.message, pending.attempts);
        if framed
            .send(WireCommand::Frame(pending.message.to_frame()))
            .await
            .is_err()
        {
            let _ = pending.responder.send(Err(Error::Disconnected));
            return false;
        }
        *retry = Delay::new(options.retry_timeout).fuse();
        *in_flight = Some(pending);
    }
    true
}

/// Retry the in-flight command, or fail it once the attempt budget is
/// spent and move on to the next queued command.
async fn retransmit<T>(
    options: &LinkOptions,
    framed: &mut Framed<T, FrameCodec>,
    queue: &mut VecDeque<Pending>,
    in_flight: &mut Option<Pending>,
    retry: &mut Fuse<Delay>,
) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = match in_flight.take() {
        Some(pending) => pending,
        None => {
            debug!("Spurious NAK");
            return true;
        }
    };

    if pending.attempts >= options.max_attempts {
        warn!(
            "Giving up on {:?} after {} attempts",
            pending.message, pending.attempts
        );
        let _ = pending.responder.send(Err(Error::Timeout));
        *retry = Fuse::terminated();
        return transmit_next(options, framed, queue, in_flight, retry).await;
    }

    pending.attempts += 1;
    debug!(
        "Retransmitting {:?} (attempt {})",
        pending.message, pending.attempts
    );
    if framed
        .send(WireCommand::Frame(pending.message.to_frame()))
        .await
        .is_err()
    {
        let _ = pending.responder.send(Err(Error::Disconnected));
        return false;
    }
    *retry = Delay::new(options.retry_timeout).fuse();
    *in_flight = Some(pending);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Crosspoint;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> LinkOptions {
        LinkOptions {
            retry_timeout: Duration::from_millis(50),
            max_attempts: 3,
        }
    }

    fn take() -> Message {
        Message::Connect {
            matrix: 0,
            level: 0,
            destination: 5,
            source: 10,
        }
    }

    fn tally() -> Message {
        Message::Tally(Crosspoint {
            matrix: 0,
            level: 0,
            destination: 5,
            source: 10,
            source_status: false,
        })
    }

    async fn expect_frame(remote: &mut tokio::io::DuplexStream, message: &Message) {
        let expected = message.to_frame().encode().unwrap();
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    async fn expect_silence(remote: &mut tokio::io::DuplexStream) {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(30), remote.read(&mut byte)).await;
        assert!(read.is_err(), "unexpected bytes on the wire");
    }

    #[tokio::test]
    async fn ack_resolves_send() {
        let (local, mut remote) = tokio::io::duplex(256);
        let link = Link::new(local, options());

        let sent = link.enqueue(take());
        expect_frame(&mut remote, &take()).await;
        remote.write_all(&[DLE, ACK]).await.unwrap();

        sent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nak_triggers_one_retransmission() {
        let (local, mut remote) = tokio::io::duplex(256);
        let link = Link::new(local, options());

        let sent = link.enqueue(take());
        expect_frame(&mut remote, &take()).await;
        remote.write_all(&[DLE, NAK]).await.unwrap();
        expect_frame(&mut remote, &take()).await;
        remote.write_all(&[DLE, ACK]).await.unwrap();

        sent.await.unwrap().unwrap();
        expect_silence(&mut remote).await;
    }

    #[tokio::test]
    async fn silent_router_exhausts_retries() {
        let (local, mut remote) = tokio::io::duplex(256);
        let opts = options();
        let link = Link::new(local, opts);

        let started = Instant::now();
        let sent = link.enqueue(take());
        for _ in 0..opts.max_attempts {
            expect_frame(&mut remote, &take()).await;
        }

        assert_eq!(sent.await.unwrap(), Err(Error::Timeout));
        // Attempts at 0, 50, 100 ms; failure once the last timer expires.
        assert!(started.elapsed() >= opts.retry_timeout * opts.max_attempts as u32);
        expect_silence(&mut remote).await;
    }

    #[tokio::test]
    async fn one_command_in_flight_fifo() {
        let (local, mut remote) = tokio::io::duplex(256);
        let link = Link::new(local, options());

        let second = Message::Connect {
            matrix: 0,
            level: 1,
            destination: 6,
            source: 11,
        };
        let first_sent = link.enqueue(take());
        let second_sent = link.enqueue(second.clone());

        expect_frame(&mut remote, &take()).await;
        // The second command must wait for the first ACK.
        expect_silence(&mut remote).await;
        remote.write_all(&[DLE, ACK]).await.unwrap();

        expect_frame(&mut remote, &second).await;
        remote.write_all(&[DLE, ACK]).await.unwrap();

        first_sent.await.unwrap().unwrap();
        second_sent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsolicited_tally_is_acked_and_forwarded() {
        let (local, mut remote) = tokio::io::duplex(256);
        let link = Link::new(local, options());
        let mut messages = link.subscribe().unwrap();

        let wire = tally().to_frame().encode().unwrap();
        remote.write_all(&wire).await.unwrap();

        let mut ack = [0u8; 2];
        remote.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [DLE, ACK]);

        assert_eq!(messages.next().await, Some(tally()));
    }

    #[tokio::test]
    async fn corrupt_frame_is_naked() {
        let (local, mut remote) = tokio::io::duplex(256);
        let _link = Link::new(local, options());

        let mut wire = tally().to_frame().encode().unwrap();
        let tampered = wire.len() - 3;
        wire[tampered] ^= 0x01;
        remote.write_all(&wire).await.unwrap();

        let mut nak = [0u8; 2];
        remote.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak, [DLE, NAK]);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_ends_streams() {
        let (local, mut remote) = tokio::io::duplex(256);
        let link = Link::new(local, options());
        let mut messages = link.subscribe().unwrap();

        let sent = link.enqueue(take());
        expect_frame(&mut remote, &take()).await;
        drop(remote);

        assert_eq!(sent.await.unwrap(), Err(Error::Disconnected));
        assert_eq!(messages.next().await, None);
        assert_eq!(link.send(take()).await, Err(Error::Disconnected));
    }

    #[test]
    fn reply_timeout_scales_with_budget() {
        let opts = LinkOptions::default();
        assert_eq!(opts.reply_timeout(), Duration::from_secs(12));
    }
}
