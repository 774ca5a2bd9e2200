//! ClientDiscoveryContext: repeater registration and name resolution for one
//! client participant.
//!
//! The context owns a [`BroadcasterSession`] and a background receive loop.
//! Searches are driven by [`SearchHandle`]s, each holding one
//! [`SearchTicket`]:
//!
//! ```text
//! begin_search ──► send ──► Pending ──(deadline, attempts left)──► resend
//!                              │  │
//!                              │  └──(deadline, last attempt)──► Err(Timeout)
//!                              ├──(matching response)──────────► Ok(addr)
//!                              └──(cancel / handle dropped)────► Err(Cancelled)
//! ```
//!
//! Session and waiter table share one mutex that is never held across an
//! `.await`; the receive loop and any number of concurrent searches go
//! through it.
//!
//! A receive error is logged and retried after a short pause.  After
//! [`MAX_CONSECUTIVE_RECEIVE_FAILURES`] in a row the loop gives up and every
//! pending and later `register` or `wait` fails with
//! [`DiscoveryError::Transport`] instead of running into its timeout.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ca_core::{
    decode_datagram, encode, BroadcasterSession, CorrelationId, InvalidName, ProtocolError,
    RetryPolicy, SearchTicket, SessionEvent, TicketStep,
};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::infrastructure::config::{ClientConfig, ConfigError};
use crate::infrastructure::transport::{DatagramTransport, TransportError};

/// Capacity of the beacon broadcast channel; slow subscribers miss the oldest.
const BEACON_CHANNEL_CAPACITY: usize = 64;

/// Pause before receiving again after a receive error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Receive errors in a row after which the receive loop stops.
pub const MAX_CONSECUTIVE_RECEIVE_FAILURES: u32 = 16;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Every attempt went unanswered.
    #[error("no response before the last retry deadline")]
    Timeout,

    /// The repeater has not confirmed registration yet.
    #[error("not registered with the repeater")]
    NotRegistered,

    /// The search was cancelled before a response arrived.
    #[error("search cancelled")]
    Cancelled,

    /// The name cannot be sent in a search request.
    #[error("invalid search name: {0}")]
    InvalidName(InvalidName),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ProtocolError> for DiscoveryError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::NotRegistered => DiscoveryError::NotRegistered,
            ProtocolError::InvalidName(reason) => DiscoveryError::InvalidName(reason),
        }
    }
}

/// A server beacon relayed by the repeater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconEvent {
    pub server: SocketAddr,
    pub beacon_id: u32,
}

/// What the receive loop has learned about the link to the repeater.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Unconfirmed,
    Registered,
    /// The receive loop gave up; nothing more will arrive.
    Stopped(ReceiveFailure),
}

impl Link {
    fn is_stopped(&self) -> bool {
        matches!(self, Link::Stopped(_))
    }
}

/// The last receive error before the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReceiveFailure {
    kind: io::ErrorKind,
    message: String,
}

impl ReceiveFailure {
    fn from_error(e: &TransportError) -> Self {
        match e {
            TransportError::Receive(source) => Self {
                kind: source.kind(),
                message: source.to_string(),
            },
            other => Self {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> DiscoveryError {
        DiscoveryError::Transport(TransportError::Receive(io::Error::new(
            self.kind,
            self.message.clone(),
        )))
    }
}

/// Resolves once the receive loop has stopped; never if the context is gone.
async fn receive_stopped(link: &mut watch::Receiver<Link>) -> DiscoveryError {
    let stopped = link.wait_for(Link::is_stopped).await.ok().map(|l| l.clone());
    match stopped {
        Some(Link::Stopped(failure)) => failure.to_error(),
        _ => std::future::pending().await,
    }
}

/// Session plus the responders waiting on outstanding searches.
#[derive(Debug)]
struct SearchState {
    session: BroadcasterSession,
    waiters: HashMap<CorrelationId, oneshot::Sender<SocketAddr>>,
}

type SharedState = Arc<Mutex<SearchState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SearchState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases `id` from both the session and the waiter table.
fn release(state: &SharedState, id: CorrelationId) -> bool {
    let mut guard = lock(state);
    guard.waiters.remove(&id);
    guard.session.cancel_search(id)
}

/// Registration and name resolution over one [`DatagramTransport`].
pub struct ClientDiscoveryContext<T: DatagramTransport + 'static> {
    transport: Arc<T>,
    state: SharedState,
    link: Arc<watch::Sender<Link>>,
    beacons: broadcast::Sender<BeaconEvent>,
    repeater: SocketAddr,
    search_targets: Vec<SocketAddr>,
    search_policy: RetryPolicy,
    registration_policy: RetryPolicy,
    receiver: JoinHandle<()>,
    span: Span,
}

impl<T: DatagramTransport + 'static> ClientDiscoveryContext<T> {
    /// Starts a context on `transport` and spawns its receive loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`] for unusable search addresses and
    /// [`DiscoveryError::Transport`] if the local address is unavailable.
    pub fn start(transport: T, config: &ClientConfig) -> Result<Self, DiscoveryError> {
        Self::start_with_span(transport, config, tracing::info_span!("ca_client"))
    }

    /// Like [`start`](Self::start), logging everything under `span`.
    pub fn start_with_span(
        transport: T,
        config: &ClientConfig,
        span: Span,
    ) -> Result<Self, DiscoveryError> {
        let search_targets = config.search_targets()?;
        let local = transport.local_addr()?;
        let client_address = match local.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => Ipv4Addr::LOCALHOST,
        };
        let session = BroadcasterSession::new(client_address, local.port())
            .with_span(tracing::debug_span!(parent: &span, "session"));

        let transport = Arc::new(transport);
        let state = Arc::new(Mutex::new(SearchState {
            session,
            waiters: HashMap::new(),
        }));
        let (link, _) = watch::channel(Link::Unconfirmed);
        let link = Arc::new(link);
        let (beacons, _) = broadcast::channel(BEACON_CHANNEL_CAPACITY);

        let receiver = tokio::spawn(
            receive_loop(
                Arc::clone(&transport),
                Arc::clone(&state),
                Arc::clone(&link),
                beacons.clone(),
            )
            .instrument(span.clone()),
        );

        Ok(Self {
            transport,
            state,
            link,
            beacons,
            repeater: config.repeater_addr(),
            search_targets,
            search_policy: config.search_retry.to_policy(),
            registration_policy: config.registration_retry.to_policy(),
            receiver,
            span,
        })
    }

    /// Registers with the local repeater, retrying per the registration policy.
    ///
    /// Returns immediately if already registered.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Timeout`] if the repeater never confirms, or
    /// [`DiscoveryError::Transport`] if the request cannot be sent or the
    /// receive loop has stopped.
    pub async fn register(&self) -> Result<(), DiscoveryError> {
        let mut link = self.link.subscribe();
        for attempt in 1..=self.registration_policy.max_attempts {
            let request = lock(&self.state).session.begin_registration();
            let Some(request) = request else {
                return Ok(());
            };
            self.span.in_scope(|| debug!("registration attempt {attempt} to {}", self.repeater));
            self.transport.send_to(&encode(&request), self.repeater).await?;

            let delay = self.registration_policy.delay_for(attempt);
            let settled = tokio::time::timeout(delay, link.wait_for(|l| *l != Link::Unconfirmed))
                .await
                .ok()
                .and_then(Result::ok)
                .map(|l| l.clone());
            match settled {
                Some(Link::Registered) => return Ok(()),
                Some(Link::Stopped(failure)) => return Err(failure.to_error()),
                Some(Link::Unconfirmed) | None => {}
            }
        }
        self.span.in_scope(|| warn!("repeater at {} never confirmed registration", self.repeater));
        Err(DiscoveryError::Timeout)
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.state).session.is_registered()
    }

    /// Starts a search for `name` using the configured search policy.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotRegistered`] before registration is confirmed
    /// and [`DiscoveryError::InvalidName`] for a name a search cannot carry
    /// (nothing is sent in either case), or [`DiscoveryError::Transport`] if
    /// the first transmission fails.
    pub async fn begin_search(&self, name: &str) -> Result<SearchHandle<T>, DiscoveryError> {
        self.begin_search_with(name, self.search_policy).await
    }

    /// Starts a search for `name` with an explicit retry policy.
    pub async fn begin_search_with(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<SearchHandle<T>, DiscoveryError> {
        let (id, command, response) = {
            let mut guard = lock(&self.state);
            let (id, command) = guard.session.new_search(name)?;
            let (tx, rx) = oneshot::channel();
            guard.waiters.insert(id, tx);
            (id, command, rx)
        };

        let handle = SearchHandle {
            transport: Arc::clone(&self.transport),
            canceller: SearchCanceller {
                state: Arc::clone(&self.state),
                id,
            },
            ticket: SearchTicket::start(name, id, policy, Instant::now().into_std()),
            datagram: BroadcasterSession::search_datagram(&command),
            targets: self.search_targets.clone(),
            response,
            link: self.link.subscribe(),
            span: self.span.clone(),
        };
        self.span.in_scope(|| debug!("search {id} for {name:?} started"));
        // On error the handle is dropped, which releases the id.
        handle.transmit().await?;
        Ok(handle)
    }

    /// Resolves `name` to a server address.
    ///
    /// `timeout` is the wait before the first retransmission; later waits
    /// follow the configured back-off, and [`DiscoveryError::Timeout`] is
    /// only returned once the last attempt's deadline has passed.
    pub async fn resolve(&self, name: &str, timeout: Duration) -> Result<SocketAddr, DiscoveryError> {
        let policy = self.search_policy.with_initial_delay(timeout);
        self.begin_search_with(name, policy).await?.wait().await
    }

    /// Receives every beacon the repeater relays from now on.
    pub fn subscribe_beacons(&self) -> broadcast::Receiver<BeaconEvent> {
        self.beacons.subscribe()
    }

    /// Number of searches still awaiting a response.
    pub fn outstanding_searches(&self) -> usize {
        lock(&self.state).session.outstanding_count()
    }
}

impl<T: DatagramTransport + 'static> Drop for ClientDiscoveryContext<T> {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Cancels one search from anywhere, synchronously.
#[derive(Debug, Clone)]
pub struct SearchCanceller {
    state: SharedState,
    id: CorrelationId,
}

impl SearchCanceller {
    /// Releases the search.  Its waiter resolves to
    /// [`DiscoveryError::Cancelled`] and no retransmission follows.
    /// Returns `false` if the search had already finished.
    pub fn cancel(&self) -> bool {
        release(&self.state, self.id)
    }
}

/// One in-flight search.  Dropping it cancels the search.
pub struct SearchHandle<T: DatagramTransport + 'static> {
    transport: Arc<T>,
    canceller: SearchCanceller,
    ticket: SearchTicket,
    datagram: Vec<u8>,
    targets: Vec<SocketAddr>,
    response: oneshot::Receiver<SocketAddr>,
    link: watch::Receiver<Link>,
    span: Span,
}

impl<T: DatagramTransport + 'static> SearchHandle<T> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.ticket.correlation_id
    }

    pub fn canceller(&self) -> SearchCanceller {
        self.canceller.clone()
    }

    /// Drives retransmissions until a response, cancellation, or the last
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Timeout`], [`DiscoveryError::Cancelled`], or
    /// [`DiscoveryError::Transport`] if a retransmission cannot be sent or
    /// the receive loop has stopped.
    pub async fn wait(mut self) -> Result<SocketAddr, DiscoveryError> {
        let span = self.span.clone();
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<SocketAddr, DiscoveryError> {
        loop {
            let deadline = Instant::from_std(self.ticket.deadline);
            tokio::select! {
                biased;

                response = &mut self.response => {
                    return match response {
                        Ok(address) => {
                            self.ticket.resolve(address);
                            info!("{:?} found at {address}", self.ticket.name);
                            Ok(address)
                        }
                        Err(_) => Err(DiscoveryError::Cancelled),
                    };
                }

                e = receive_stopped(&mut self.link) => {
                    self.canceller.cancel();
                    return Err(e);
                }

                _ = tokio::time::sleep_until(deadline) => {
                    match self.ticket.on_deadline(Instant::now().into_std()) {
                        TicketStep::Wait => {}
                        TicketStep::Retransmit { attempt } => {
                            if !lock(&self.canceller.state).session.is_outstanding(self.correlation_id()) {
                                return Err(DiscoveryError::Cancelled);
                            }
                            debug!("search {} attempt {attempt}", self.correlation_id());
                            self.transmit().await?;
                        }
                        TicketStep::Exhausted => {
                            debug!(
                                "search {} for {:?} exhausted after {} attempts",
                                self.correlation_id(),
                                self.ticket.name,
                                self.ticket.attempt
                            );
                            return Err(DiscoveryError::Timeout);
                        }
                    }
                }
            }
        }
    }

    async fn transmit(&self) -> Result<(), TransportError> {
        for &target in &self.targets {
            self.transport.send_to(&self.datagram, target).await?;
        }
        Ok(())
    }
}

impl<T: DatagramTransport + 'static> Drop for SearchHandle<T> {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

async fn receive_loop<T: DatagramTransport + 'static>(
    transport: Arc<T>,
    state: SharedState,
    link: Arc<watch::Sender<Link>>,
    beacons: broadcast::Sender<BeaconEvent>,
) {
    let mut failures = 0u32;
    loop {
        let (bytes, sender) = match transport.recv_from().await {
            Ok(received) => {
                failures = 0;
                received
            }
            // ICMP errors from earlier sends surface here on some platforms.
            Err(TransportError::Receive(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("recv error: {e}");
                continue;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_RECEIVE_FAILURES {
                    warn!("receive loop stopped after {failures} errors in a row: {e}");
                    link.send_replace(Link::Stopped(ReceiveFailure::from_error(&e)));
                    return;
                }
                debug!("recv error ({failures} in a row): {e}");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                continue;
            }
        };

        let commands = match decode_datagram(&bytes) {
            Ok(commands) => commands,
            Err(e) => {
                debug!("discarding datagram from {sender}: {e}");
                continue;
            }
        };

        for command in &commands {
            let event = {
                let mut guard = lock(&state);
                let event = guard.session.on_receive(command, sender);
                if let SessionEvent::SearchMatched {
                    correlation_id,
                    address,
                    ..
                } = &event
                {
                    if let Some(waiter) = guard.waiters.remove(correlation_id) {
                        let _ = waiter.send(*address);
                    }
                }
                event
            };

            match event {
                SessionEvent::Registered { .. } => {
                    link.send_replace(Link::Registered);
                }
                SessionEvent::Beacon { server, beacon_id } => {
                    // No subscribers is fine.
                    let _ = beacons.send(BeaconEvent { server, beacon_id });
                }
                SessionEvent::UnsolicitedResponse { correlation_id } => {
                    trace!("unsolicited response {correlation_id} from {sender}");
                }
                SessionEvent::SearchMatched { .. } | SessionEvent::Ignored => {}
            }
        }
    }
}
