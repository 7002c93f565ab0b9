use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use futures::channel::mpsc::UnboundedReceiver;
use futures::{future::FutureExt, select_biased, stream::StreamExt};

use futures_timer::Delay;

use log::{debug, info, warn};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::constants::*;
use crate::error::*;
use crate::link::{Link, LinkOptions};
use crate::message::Message;
use crate::state::{CrosspointCache, CrosspointState, CrosspointStatus};
use crate::transport::TransportConfig;

/// Validation bounds for crosspoint coordinates, from the configuration.
/// The matrix field is capped at 15 by its 4 wire bits.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_sources: u16,
    pub max_destinations: u16,
    pub max_levels: u8,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_sources: 1024,
            max_destinations: 1024,
            max_levels: 16,
        }
    }
}

/// Everything the session layer tells the world.
#[derive(Clone, Debug, PartialEq)]
pub enum RouterEvent {
    CrosspointChange(CrosspointState),
    Connected,
    Disconnected,
    Error(Error),
}

struct Shared {
    cache: RwLock<CrosspointCache>,
    link: RwLock<Option<Link>>,
    events: broadcast::Sender<RouterEvent>,
    limits: Limits,
    options: LinkOptions,
}

/// The router session: owns the crosspoint cache, interprets tallies from
/// the link, and exposes the typed command API. Cheap to clone; all clones
/// share the same cache and event channel.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    pub fn new(limits: Limits, options: LinkOptions) -> Router {
        let (events, _) = broadcast::channel(256);
        Router {
            shared: Arc::new(Shared {
                cache: RwLock::new(CrosspointCache::new()),
                link: RwLock::new(None),
                events,
                limits,
                options,
            }),
        }
    }

    /// Subscribe to session events. Slow consumers may observe lag, never
    /// reordering.
    pub fn events(&self) -> broadcast::Receiver<RouterEvent> {
        self.shared.events.subscribe()
    }

    /// Adopt an established link and start interpreting its traffic.
    /// Returns the session task handle, which completes when the link dies.
    pub fn attach(&self, link: Link) -> Result<JoinHandle<()>, Error> {
        let messages = link.subscribe()?;
        *self.shared.link.write().expect("link lock") = Some(link);
        let _ = self.shared.events.send(RouterEvent::Connected);
        let shared = self.shared.clone();
        Ok(tokio::spawn(session_loop(shared, messages)))
    }

    /// Rebuild the tally cache after a (re)connect: request a dump per
    /// level on matrix 0, paced so slow serial links are not flooded.
    /// Best-effort; a lost dump leaves blanks that later tallies fill.
    pub fn reconcile(&self) {
        let link = match self.link() {
            Ok(link) => link,
            Err(_) => return,
        };
        let levels = self.shared.limits.max_levels;
        tokio::spawn(async move {
            info!("Requesting tally dumps for {} levels", levels);
            for level in 0..levels {
                let _ = link.enqueue(Message::TallyDumpRequest { matrix: 0, level });
                Delay::new(DUMP_PACING).await;
            }
        });
    }

    /// Keep the router link up forever: open the transport, reconcile,
    /// serve the session until the link drops, back off, repeat.
    pub async fn run(&self, transport: TransportConfig) {
        loop {
            match transport.open().await {
                Ok(stream) => {
                    info!("Router link up ({})", transport.endpoint());
                    let link = Link::new(stream, self.shared.options);
                    match self.attach(link) {
                        Ok(session) => {
                            self.reconcile();
                            let _ = session.await;
                            info!("Router link down, retrying in {:?}", RECONNECT_DELAY);
                        }
                        Err(e) => warn!("Could not start session: {}", e),
                    }
                }
                Err(e) => {
                    warn!("Router unreachable: {}", e);
                    let _ = self.shared.events.send(RouterEvent::Error(e.into()));
                }
            }
            Delay::new(RECONNECT_DELAY).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.read().expect("link lock").is_some()
    }

    /// Route `source` to `destination`. Fire-and-forget: the pending state
    /// is recorded (and broadcast) immediately, the wire outcome arrives
    /// later as a tally, and a link failure surfaces as
    /// [RouterEvent::Error].
    pub fn take(&self, matrix: u8, level: u8, destination: u16, source: u16) -> Result<(), Error> {
        self.validate(matrix, level, destination, Some(source))?;
        let link = self.link()?;

        let state = self.shared.cache.write().expect("cache lock").upsert(
            matrix,
            level,
            destination,
            source,
            CrosspointStatus::Pending,
            false,
        );
        let _ = self.shared.events.send(RouterEvent::CrosspointChange(state));

        let delivery = link.enqueue(Message::Connect {
            matrix,
            level,
            destination,
            source,
        });
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            let result = delivery.await.unwrap_or(Err(Error::Disconnected));
            if let Err(e) = result {
                warn!("Take failed on the link: {}", e);
                let _ = events.send(RouterEvent::Error(e));
            }
        });
        Ok(())
    }

    /// One take per level, dispatched in the order given. Not atomic on
    /// the wire; each level is its own connect command.
    pub fn take_multi(
        &self,
        matrix: u8,
        levels: &[u8],
        destination: u16,
        source: u16,
    ) -> Result<(), Error> {
        for &level in levels {
            self.validate(matrix, level, destination, Some(source))?;
        }
        for &level in levels {
            self.take(matrix, level, destination, source)?;
        }
        Ok(())
    }

    /// Ask the router for the current source of a destination and wait for
    /// the answering tally.
    pub async fn interrogate(
        &self,
        matrix: u8,
        level: u8,
        destination: u16,
    ) -> Result<u16, Error> {
        self.validate(matrix, level, destination, None)?;
        let link = self.link()?;

        // Subscribe before asking so the answer cannot slip past.
        let mut events = self.shared.events.subscribe();
        link.send(Message::Interrogate {
            matrix,
            level,
            destination,
        })
        .await?;

        let mut deadline = Delay::new(self.shared.options.reply_timeout()).fuse();
        loop {
            select_biased! {
                _ = &mut deadline => return Err(Error::Timeout),
                event = events.recv().fuse() => match event {
                    Ok(RouterEvent::CrosspointChange(state))
                        if state.matrix == matrix
                            && state.level == level
                            && state.destination == destination
                            && state.status == CrosspointStatus::Connected =>
                    {
                        return Ok(state.source)
                    }
                    Ok(RouterEvent::Disconnected) => return Err(Error::Disconnected),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Interrogate listener lagged by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::Disconnected),
                },
            }
        }
    }

    /// Ask for the destination table of one level; the result arrives
    /// asynchronously as tallies.
    pub fn request_tally_dump(&self, matrix: u8, level: u8) -> Result<(), Error> {
        self.validate(matrix, level, 0, None)?;
        let _ = self.link()?.enqueue(Message::TallyDumpRequest { matrix, level });
        Ok(())
    }

    /// Stage a crosspoint into a router-side salvo group, pending
    /// [fire_salvo](Router::fire_salvo).
    pub fn stage_salvo(
        &self,
        group: u8,
        matrix: u8,
        level: u8,
        destination: u16,
        source: u16,
    ) -> Result<(), Error> {
        self.validate(matrix, level, destination, Some(source))?;
        let _ = self.link()?.enqueue(Message::ConnectOnGoGroupSalvo {
            matrix,
            level,
            destination,
            source,
            group,
        });
        Ok(())
    }

    /// Fire every crosspoint staged in a router-side salvo group.
    pub fn fire_salvo(&self, group: u8) -> Result<(), Error> {
        let _ = self.link()?.enqueue(Message::GoGroupSalvo { group });
        Ok(())
    }

    pub fn get(&self, matrix: u8, level: u8, destination: u16) -> Option<CrosspointState> {
        self.shared
            .cache
            .read()
            .expect("cache lock")
            .get(matrix, level, destination)
    }

    pub fn get_all(&self) -> Vec<CrosspointState> {
        self.shared.cache.read().expect("cache lock").all()
    }

    pub fn get_by_level(&self, matrix: u8, level: u8) -> Vec<CrosspointState> {
        self.shared
            .cache
            .read()
            .expect("cache lock")
            .by_level(matrix, level)
    }

    pub fn crosspoint_count(&self) -> usize {
        self.shared.cache.read().expect("cache lock").len()
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.shared.cache.read().expect("cache lock").last_update()
    }

    fn link(&self) -> Result<Link, Error> {
        self.shared
            .link
            .read()
            .expect("link lock")
            .clone()
            .ok_or(Error::Disconnected)
    }

    fn validate(
        &self,
        matrix: u8,
        level: u8,
        destination: u16,
        source: Option<u16>,
    ) -> Result<(), Error> {
        let limits = self.shared.limits;
        if matrix > 15 {
            return Err(Error::OutOfRange {
                field: "matrix",
                value: matrix as u32,
                max: 15,
            });
        }
        if level >= limits.max_levels {
            return Err(Error::OutOfRange {
                field: "level",
                value: level as u32,
                max: limits.max_levels as u32 - 1,
            });
        }
        if destination >= limits.max_destinations {
            return Err(Error::OutOfRange {
                field: "destination",
                value: destination as u32,
                max: limits.max_destinations as u32 - 1,
            });
        }
        if let Some(source) = source {
            if source >= limits.max_sources {
                return Err(Error::OutOfRange {
                    field: "source",
                    value: source as u32,
                    max: limits.max_sources as u32 - 1,
                });
            }
        }
        Ok(())
    }
}

async fn session_loop(shared: Arc<Shared>, mut messages: UnboundedReceiver<Message>) {
    while let Some(message) = messages.next().await {
        handle_message(&shared, message);
    }
    *shared.link.write().expect("link lock") = None;
    let _ = shared.events.send(RouterEvent::Disconnected);
}

fn handle_message(shared: &Shared, message: Message) {
    match message {
        Message::Tally(xp) | Message::Connected(xp) => {
            apply(
                shared,
                xp.matrix,
                xp.level,
                xp.destination,
                xp.source,
                xp.source_status,
            );
        }
        Message::TallyDumpByte {
            matrix,
            level,
            sources,
        } => {
            debug!(
                "Dump block (byte) m{} l{}, {} destinations",
                matrix,
                level,
                sources.len()
            );
            for (destination, source) in sources.into_iter().enumerate() {
                apply(shared, matrix, level, destination as u16, source as u16, false);
            }
        }
        Message::TallyDumpWord {
            matrix,
            level,
            entries,
        } => {
            debug!(
                "Dump block (word) m{} l{}, {} destinations",
                matrix,
                level,
                entries.len()
            );
            for e in entries {
                apply(shared, matrix, level, e.destination, e.source, e.source_status);
            }
        }
        Message::ConnectOnGoAck { group } => debug!("Salvo group {} staged", group),
        Message::GoDoneAck { group, status } => {
            info!("Salvo group {} fired (status {})", group, status)
        }
        Message::GroupSalvoTally { group, status } => {
            debug!("Salvo group {} status {}", group, status)
        }
        other => debug!("Ignoring {:?}", other),
    }
}

fn apply(
    shared: &Shared,
    matrix: u8,
    level: u8,
    destination: u16,
    source: u16,
    source_status: bool,
) {
    let state = shared.cache.write().expect("cache lock").upsert(
        matrix,
        level,
        destination,
        source,
        CrosspointStatus::Connected,
        source_status,
    );
    let _ = shared.events.send(RouterEvent::CrosspointChange(state));
}
