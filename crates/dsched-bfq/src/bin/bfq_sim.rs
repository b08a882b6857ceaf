#![warn(missing_docs)]

//! Runs sequential and random readers against a simulated disk under BFQ and
//! prints the scheduler's statistics as JSON.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dsched_bfq::{
    BfqConfig, BfqScheduler, Bio, BioId, BioIdGen, BioKind, Clock, DiskDriver, DiskSchedPolicy,
    EnqueueStatus, MonotonicClock, TdioSnapshot, TokioAsTimer,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Simulated device capacity.
const DISK_SIZE: u64 = 64 << 30;

#[derive(Parser, Debug)]
#[command(name = "bfq-sim")]
#[command(about = "BFQ scheduler simulator", long_about = None)]
struct Cli {
    /// JSON scheduler configuration; defaults apply when omitted
    #[arg(short, long, env = "BFQ_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of sequential readers
    #[arg(long, default_value = "2")]
    sequential: usize,

    /// Number of random readers
    #[arg(long, default_value = "2")]
    random: usize,

    /// Requests issued by each reader
    #[arg(short, long, default_value = "200")]
    requests: u64,

    /// Size of each request in bytes
    #[arg(long, default_value = "65536")]
    request_size: u64,

    /// Device tag-queue depth
    #[arg(long, default_value = "4")]
    slots: usize,

    /// Pause between a completion and the next request, in microseconds
    #[arg(long, default_value = "200")]
    think_us: u64,

    /// Seek penalty of the simulated disk, in microseconds
    #[arg(long, default_value = "4000")]
    seek_us: u64,

    /// Transfer rate of the simulated disk, in bytes per microsecond
    #[arg(long, default_value = "150")]
    bytes_per_us: u64,

    /// Disable anticipatory idling
    #[arg(long)]
    no_anticipation: bool,

    /// Let the peak-rate estimator tune the max budget
    #[arg(long)]
    auto_max_budget: bool,
}

type Waiters = Arc<Mutex<HashMap<BioId, oneshot::Sender<()>>>>;

/// Single-head disk: requests are serviced one after another, and any request
/// that does not start where the previous one ended pays a seek.
struct SimDisk {
    handle: Handle,
    clock: Arc<dyn Clock>,
    max_slots: usize,
    in_use: AtomicUsize,
    head: AtomicU64,
    busy_until_us: AtomicU64,
    seek_us: u64,
    bytes_per_us: u64,
    completions: mpsc::UnboundedSender<Bio>,
}

impl SimDisk {
    fn service_us(&self, bio: &Bio) -> u64 {
        let head = self.head.swap(bio.end_offset(), Ordering::AcqRel);
        let seek = if head == bio.offset { 0 } else { self.seek_us };
        seek + bio.size / self.bytes_per_us.max(1)
    }

    fn release_slot(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DiskDriver for SimDisk {
    fn max_slots(&self) -> usize {
        self.max_slots
    }

    fn slots_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn dispatch(&self, bio: Bio) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        let now = self.clock.now_us();
        let service = self.service_us(&bio);
        let mut done_at = now;
        let _ = self
            .busy_until_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |busy| {
                done_at = busy.max(now) + service;
                Some(done_at)
            });

        let delay = Duration::from_micros(done_at - now);
        let completions = self.completions.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.send(bio);
        });
    }

    fn cancel(&self, bio: Bio) {
        warn!("request {:?} cancelled before dispatch", bio.id);
    }
}

struct Reader {
    sequential: bool,
    requests: u64,
    request_size: u64,
    think: Duration,
}

impl Reader {
    async fn run(
        self,
        sched: Arc<BfqScheduler>,
        ids: Arc<BioIdGen>,
        waiters: Waiters,
    ) -> Result<(TdioSnapshot, Duration)> {
        let tdio = sched.new_submitter();
        let mut rng = StdRng::from_entropy();
        let blocks = DISK_SIZE / self.request_size;
        let mut next = rng.gen_range(0..blocks / 2) * self.request_size;
        let started = Instant::now();

        for _ in 0..self.requests {
            let offset = if self.sequential {
                next
            } else {
                rng.gen_range(0..blocks) * self.request_size
            };
            next = offset + self.request_size;

            let bio = Bio::new(ids.next_id(), BioKind::Read, offset, self.request_size);
            let (tx, rx) = oneshot::channel();
            waiters.lock().insert(bio.id, tx);
            if let EnqueueStatus::Rejected(bio) = sched.enqueue(&tdio, bio) {
                waiters.lock().remove(&bio.id);
                bail!("{} request {:?} rejected", tdio.id(), bio.id);
            }
            rx.await
                .with_context(|| format!("{} lost a completion", tdio.id()))?;

            if !self.think.is_zero() {
                tokio::time::sleep(self.think).await;
            }
        }

        let elapsed = started.elapsed();
        let snapshot = tdio.snapshot();
        sched.destroy_submitter(&tdio);
        Ok((snapshot, elapsed))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.request_size == 0 {
        bail!("request size must be non-zero");
    }

    let mut config = match &cli.config {
        Some(path) => BfqConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BfqConfig::default(),
    };
    if cli.no_anticipation {
        config.as_enabled = false;
    }
    if cli.auto_max_budget {
        config.auto_max_budget = true;
    }
    info!(
        "bfq-sim starting: {} sequential, {} random, {} requests of {} bytes each",
        cli.sequential, cli.random, cli.requests, cli.request_size
    );

    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let disk = Arc::new(SimDisk {
        handle: Handle::current(),
        clock: Arc::clone(&clock),
        max_slots: cli.slots,
        in_use: AtomicUsize::new(0),
        head: AtomicU64::new(0),
        busy_until_us: AtomicU64::new(0),
        seek_us: cli.seek_us,
        bytes_per_us: cli.bytes_per_us,
        completions: completion_tx,
    });
    let timer = Arc::new(TokioAsTimer::new(Handle::current()));
    let sched = BfqScheduler::new(config, disk.clone(), timer, clock)?;
    sched.prepare()?;

    let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
    let completer = {
        let sched = Arc::clone(&sched);
        let disk = Arc::clone(&disk);
        let waiters = Arc::clone(&waiters);
        tokio::spawn(async move {
            while let Some(mut bio) = completion_rx.recv().await {
                disk.release_slot();
                sched.on_completion(&mut bio);
                debug!("request {:?} completed", bio.id);
                if let Some(tx) = waiters.lock().remove(&bio.id) {
                    let _ = tx.send(());
                }
                sched.poll();
            }
        })
    };

    let ids = Arc::new(BioIdGen::new());
    let think = Duration::from_micros(cli.think_us);
    let mut readers = Vec::new();
    for sequential in std::iter::repeat(true)
        .take(cli.sequential)
        .chain(std::iter::repeat(false).take(cli.random))
    {
        let reader = Reader {
            sequential,
            requests: cli.requests,
            request_size: cli.request_size,
            think,
        };
        let task = tokio::spawn(reader.run(
            Arc::clone(&sched),
            Arc::clone(&ids),
            Arc::clone(&waiters),
        ));
        readers.push((sequential, task));
    }

    for (sequential, task) in readers {
        let (snapshot, elapsed) = task.await.context("reader task panicked")??;
        let bytes = cli.requests * cli.request_size;
        let mib_per_s = bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / (1 << 20) as f64;
        info!(
            "{} ({}): {:.1} MiB/s over {:?}, final budget {}, seek_avg {}, think_avg_us {}",
            snapshot.id,
            if sequential { "sequential" } else { "random" },
            mib_per_s,
            elapsed,
            snapshot.budget,
            snapshot.seek_avg,
            snapshot.think_avg_us
        );
    }

    sched.teardown()?;
    completer.abort();

    println!("{}", serde_json::to_string_pretty(&sched.stats())?);
    Ok(())
}
