use anyhow::{anyhow, ensure, Result};
use cfg_if::cfg_if;
use crossbeam_utils::thread::scope;
use log::{debug, info, warn};
use rand::prelude::*;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Instant;

use shared_handle::config::stress::{setup, Config, MemStats, Op, Perf};
use shared_handle::SharedHandle;

cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        #[global_allocator]
        static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

        struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }
        impl MemSampler {
            pub fn new() -> Result<Self> {
                Ok(MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib().map_err(|e| anyhow!("{e}"))?,
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib()
                        .map_err(|e| anyhow!("{e}"))?,
                })
            }
            /// Returns `None` if jemalloc refuses the query.
            pub fn sample(&self) -> Option<usize> {
                match self.epoch_mib.advance().and_then(|_| self.allocated_mib.read()) {
                    Ok(allocated) => Some(allocated),
                    Err(e) => {
                        warn!("skipping memory sample: {e}");
                        None
                    }
                }
            }
        }
    } else {
        struct MemSampler {}
        impl MemSampler {
            pub fn new() -> Result<Self> {
                info!("NOTE: Memory usage benchmark is supported only for linux.");
                Ok(MemSampler {})
            }
            pub fn sample(&self) -> Option<usize> {
                Some(0)
            }
        }
    }
}

static CREATED: AtomicUsize = AtomicUsize::new(0);
static DROPPED: AtomicUsize = AtomicUsize::new(0);

/// Payload that counts its constructions and drops.
struct Tracked {
    id: usize,
}

impl Tracked {
    fn new(id: usize) -> Self {
        CREATED.fetch_add(1, Ordering::Relaxed);
        Self { id }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        DROPPED.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, output) = setup()?;
    if config.dry_run {
        return Ok(());
    }

    println!("{}", config);
    let mem_sampler = MemSampler::new()?;
    let perf = bench(&config, &mem_sampler)?;
    output.write_record(&config, &perf)?;
    println!("{}", perf);

    ensure!(
        perf.leaked() == 0,
        "{} payloads were created but {} were dropped",
        perf.created,
        perf.dropped
    );
    Ok(())
}

fn bench(config: &Config, mem_sampler: &MemSampler) -> Result<Perf> {
    let root_handles: Vec<SharedHandle<Tracked>> = (0..config.roots)
        .map(|id| SharedHandle::new(Tracked::new(id)))
        .collect();
    info!("seeded {} roots", root_handles.len());

    let roots = root_handles.as_slice();
    let next_id = &AtomicUsize::new(config.roots);
    let barrier = &Barrier::new(config.threads + config.aux_thread);

    let (ops, (peak_mem, avg_mem)) = scope(|s| -> Result<(u64, (usize, usize))> {
        // sampling thread
        let sampler = if config.aux_thread > 0 {
            Some(s.spawn(move |_| sample_memory(config, barrier, mem_sampler)))
        } else {
            None
        };

        let workers: Vec<_> = (0..config.threads)
            .map(|_| s.spawn(move |_| run_worker(config, roots, barrier, next_id)))
            .collect();

        let mut ops = 0;
        for (t, worker) in workers.into_iter().enumerate() {
            let local_ops = worker
                .join()
                .map_err(|_| anyhow!("worker {t} panicked"))?;
            debug!("worker {t}: {local_ops} ops");
            ops += local_ops;
        }
        let mem = match sampler {
            Some(sampler) => sampler
                .join()
                .map_err(|_| anyhow!("memory sampler panicked"))?,
            None => (0, 0),
        };
        Ok((ops, mem))
    })
    .map_err(|_| anyhow!("a stress thread panicked"))??;
    info!("end");

    // Every payload must be gone once the roots are released too.
    drop(root_handles);

    Ok(Perf {
        ops_per_sec: ops / config.interval,
        peak_mem,
        avg_mem,
        created: CREATED.load(Ordering::Acquire),
        dropped: DROPPED.load(Ordering::Acquire),
    })
}

fn sample_memory(config: &Config, barrier: &Barrier, mem_sampler: &MemSampler) -> (usize, usize) {
    let mut stats = MemStats::default();
    barrier.wait();

    let start = Instant::now();
    let mut next_sampling = start + config.sampling_period;
    while start.elapsed() < config.duration {
        let now = Instant::now();
        if now > next_sampling {
            stats.record(mem_sampler.sample());
            next_sampling = now + config.sampling_period;
        }
        std::thread::sleep(config.aux_thread_period);
    }

    (stats.peak(), stats.avg())
}

fn run_worker(
    config: &Config,
    roots: &[SharedHandle<Tracked>],
    barrier: &Barrier,
    next_id: &AtomicUsize,
) -> u64 {
    let rng = &mut rand::thread_rng();
    let mut local: Vec<SharedHandle<Tracked>> = Vec::with_capacity(config.local);
    local.resize_with(config.local, SharedHandle::empty);
    let mut checksum = 0usize;
    let mut ops: u64 = 0;
    barrier.wait();

    let start = Instant::now();
    while start.elapsed() < config.duration {
        let slot = rng.gen_range(0..local.len());
        let root = &roots[config.root_dist.sample(rng)];
        match Op::OPS[config.op_dist.sample(rng)] {
            Op::Clone => {
                local[slot] = root.clone();
            }
            Op::CloneFrom => {
                local[slot].clone_from(root);
            }
            Op::Take => {
                let mut moved = SharedHandle::take(&mut local[slot]);
                let dst = rng.gen_range(0..local.len());
                local[dst].move_assign(&mut moved);
            }
            Op::Reset => {
                local[slot].reset();
            }
            Op::ResetWith => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                local[slot].reset_with(Tracked::new(id));
            }
            Op::Drop => {
                drop(SharedHandle::take(&mut local[slot]));
            }
        }
        if let Some(payload) = SharedHandle::as_ref(&local[slot]) {
            checksum = checksum.wrapping_add(payload.id);
        }
        ops += 1;
    }

    black_box(checksum);
    ops
}
