use std::{future::Future, path::PathBuf, time::Duration};

use clap::ValueEnum;
use log::{debug, info, warn};
use port_drop_common::{
    CONTROL_SLOT, DropCounter, MAP_DROP_COUNTER, MAP_PORT_CONFIG, PortConfig, XDP_PROGRAM,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::time::{self, MissedTickBehavior};

use crate::attach::{AttachmentHandle, AttachmentManager, XdpMode};
use crate::collection::Collection;
use crate::error::ControlError;
use crate::iface::Interface;
use crate::table::Table;

pub const DEFAULT_IFACE: &str = "eth0";
pub const DEFAULT_OBJECT: &str = "drop_tcp.o";
pub const DEFAULT_INTERVAL_SECS: u64 = 2;

/// What the loop does with the statistics table on every tick.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum StatsPolicy {
    /// Report the counter as the kernel program maintains it
    Observe,
    /// Add a synthetic 1..=4 drops per tick and write the sum back
    #[default]
    Simulate,
    /// Attach only; no statistics table is bound
    Off,
}

#[derive(Clone, Debug)]
pub struct ControlOptions {
    pub object: PathBuf,
    pub iface: String,
    pub program: String,
    pub config_map: String,
    pub stats_map: String,
    pub port: Option<u16>,
    pub xdp_mode: XdpMode,
    pub interval: Duration,
    pub stats: StatsPolicy,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            object: PathBuf::from(DEFAULT_OBJECT),
            iface: DEFAULT_IFACE.to_owned(),
            program: XDP_PROGRAM.to_owned(),
            config_map: MAP_PORT_CONFIG.to_owned(),
            stats_map: MAP_DROP_COUNTER.to_owned(),
            port: None,
            xdp_mode: XdpMode::default(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            stats: StatsPolicy::default(),
        }
    }
}

/// Everything acquired during startup. Fields drop in declaration order, so
/// the attachment is always released before the collection it came from.
pub struct Session<C: Collection> {
    attachment: AttachmentHandle<C::Link>,
    stats: Option<Table>,
    collection: C,
}

impl<C: Collection> Session<C> {
    /// Bind tables, resolve the interface, attach, then write the initial
    /// configuration. Any failure releases what was acquired so far.
    pub fn start(
        mut collection: C,
        manager: &AttachmentManager,
        opts: &ControlOptions,
    ) -> Result<Self, ControlError> {
        let config = opts
            .port
            .map(|_| Table::bind(&collection, &opts.config_map))
            .transpose()?;
        let stats = match opts.stats {
            StatsPolicy::Off => None,
            StatsPolicy::Observe | StatsPolicy::Simulate => {
                Some(Table::bind(&collection, &opts.stats_map)?)
            }
        };
        for table in config.iter().chain(stats.iter()) {
            debug!("bound table {} {:?}", table.name(), table.layout());
        }

        let iface = Interface::resolve(&opts.iface)?;
        let attachment = manager.attach(&mut collection, &opts.program, &iface, opts.xdp_mode)?;

        let mut session = Self {
            attachment,
            stats,
            collection,
        };
        if let (Some(port), Some(config)) = (opts.port, config) {
            config.put(&mut session.collection, CONTROL_SLOT, PortConfig { port })?;
            info!("dropping TCP packets to port {port} on {iface}");
        }
        Ok(session)
    }

    pub fn attachment(&self) -> &AttachmentHandle<C::Link> {
        &self.attachment
    }

    #[cfg(test)]
    pub fn collection(&self) -> &C {
        &self.collection
    }

    #[cfg(test)]
    pub fn collection_mut(&mut self) -> &mut C {
        &mut self.collection
    }

    /// Detach, then release the collection.
    pub fn close(mut self) -> Result<(), ControlError> {
        self.attachment.detach()
    }
}

/// Sink for the counter value published on every tick.
pub trait Reporter {
    fn report(&mut self, packets: u64);
}

pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, packets: u64) {
        info!("dropped packets: {packets}");
    }
}

/// Source of the synthetic drops added under [`StatsPolicy::Simulate`].
pub trait Increment {
    fn next_increment(&mut self) -> u64;
}

pub struct RandomIncrement {
    rng: StdRng,
}

impl RandomIncrement {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for RandomIncrement {
    fn default() -> Self {
        Self::new()
    }
}

impl Increment for RandomIncrement {
    fn next_increment(&mut self) -> u64 {
        self.rng.gen_range(1..=4)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

pub struct ControlLoop<R, I> {
    interval: Duration,
    policy: StatsPolicy,
    reporter: R,
    increment: I,
    state: LoopState,
}

impl<R: Reporter, I: Increment> ControlLoop<R, I> {
    pub fn new(interval: Duration, policy: StatsPolicy, reporter: R, increment: I) -> Self {
        Self {
            interval,
            policy,
            reporter,
            increment,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    #[cfg(test)]
    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Tick every interval until `shutdown` resolves or a tick fails.
    /// Shutdown is only observed between ticks; a table operation in progress
    /// always completes.
    pub async fn run<C, S>(
        &mut self,
        session: &mut Session<C>,
        shutdown: S,
    ) -> Result<(), ControlError>
    where
        C: Collection,
        S: Future<Output = ()>,
    {
        self.state = LoopState::Running;
        info!(
            "polling statistics every {:?} ({:?})",
            self.interval, self.policy
        );

        tokio::pin!(shutdown);
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.tick(session) {
                break Err(err);
            }
        };

        self.state = LoopState::Stopped;
        outcome
    }

    /// One pass over the statistics table. Returns the published value, or
    /// `None` when no statistics table is bound.
    ///
    /// The read and the write back are not atomic with respect to the kernel
    /// program: drops it counts in between are overwritten.
    pub fn tick<C: Collection>(
        &mut self,
        session: &mut Session<C>,
    ) -> Result<Option<u64>, ControlError> {
        let Some(stats) = session.stats.as_ref() else {
            return Ok(None);
        };

        let observed = match stats.get::<_, u32, DropCounter>(&session.collection, CONTROL_SLOT)
        {
            Ok(counter) => counter.packets,
            Err(err) if err.is_absent_key() => {
                warn!("{err}: key {CONTROL_SLOT} is absent, counting from 0");
                0
            }
            Err(err) => return Err(err),
        };

        let packets = match self.policy {
            StatsPolicy::Simulate => {
                let packets = observed.saturating_add(self.increment.next_increment());
                stats.put(
                    &mut session.collection,
                    CONTROL_SLOT,
                    DropCounter { packets },
                )?;
                packets
            }
            StatsPolicy::Observe | StatsPolicy::Off => observed,
        };

        self.reporter.report(packets);
        Ok(Some(packets))
    }
}
