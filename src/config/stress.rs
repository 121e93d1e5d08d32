use anyhow::{ensure, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::cmp::max;
use std::ffi::OsString;
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

/// Mix of handle operations each worker draws from.
#[derive(PartialEq, Eq, Debug, ValueEnum, Clone, Copy)]
pub enum Workload {
    /// Mostly copies of the shared roots.
    CloneHeavy,
    Balanced,
    /// Mostly fresh payloads, moves and releases.
    Churn,
}

impl Workload {
    /// Weights over [`Op::OPS`].
    pub fn weights(self) -> [u32; 6] {
        match self {
            Workload::CloneHeavy => [6, 2, 1, 1, 0, 1],
            Workload::Balanced => [3, 2, 1, 1, 1, 2],
            Workload::Churn => [1, 1, 2, 2, 3, 3],
        }
    }

    fn name(self) -> String {
        self.to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Op {
    /// Copy a root into a local slot.
    Clone,
    /// Copy-assign a root over a local slot.
    CloneFrom,
    /// Move a local slot into another one.
    Take,
    Reset,
    /// Replace a local slot with a fresh payload.
    ResetWith,
    /// Drop whatever a local slot holds.
    Drop,
}

impl Op {
    pub const OPS: [Op; 6] = [
        Op::Clone,
        Op::CloneFrom,
        Op::Take,
        Op::Reset,
        Op::ResetWith,
        Op::Drop,
    ];
}

pub struct Config {
    pub workload: Workload,
    pub threads: usize,
    pub roots: usize,
    pub local: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub op_dist: WeightedIndex<u32>,
    pub root_dist: Uniform<usize>,
    pub interval: u64,
    pub duration: Duration,
    pub dry_run: bool,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, {} roots, {} local handles",
            self.workload, self.threads, self.roots, self.local,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone, Debug)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    /// Payloads constructed during the run, roots included.
    pub created: usize,
    /// Payloads dropped by the time every handle was released.
    pub dropped: usize,
}

impl Perf {
    /// Payloads that were never freed, or freed more than once if negative.
    pub fn leaked(&self) -> isize {
        self.created as isize - self.dropped as isize
    }
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, created: {}, dropped: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.created,
            self.dropped
        )
    }
}

/// Running peak and average of allocator samples.
#[derive(Default, Debug, Clone, Copy)]
pub struct MemStats {
    samples: usize,
    acc: usize,
    peak: usize,
}

impl MemStats {
    /// Failed samples are skipped, not counted as zero.
    pub fn record(&mut self, sample: Option<usize>) {
        if let Some(allocated) = sample {
            self.samples += 1;
            self.acc += allocated;
            self.peak = max(self.peak, allocated);
        }
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn avg(&self) -> usize {
        if self.samples == 0 {
            return 0;
        }
        self.acc / self.samples
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    for (i, unit) in UNITS.iter().enumerate() {
        if num / 2usize.pow(i as u32 * 10) < 1000 {
            return format!("{:.3} {}", num as f64 / 2f64.powf(i as f64 * 10.0), unit);
        }
    }
    format!(
        "{:.3} {}",
        num as f64 / 2f64.powf((UNITS.len() - 1) as f64 * 10.0),
        UNITS[UNITS.len() - 1]
    )
}

const HEADER: [&str; 11] = [
    "workload",
    "threads",
    "roots",
    "local",
    "sampling_period",
    "throughput",
    "peak_mem",
    "avg_mem",
    "created",
    "dropped",
    "interval",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) -> Result<()> {
        if let Some(mut output) = self.output {
            output
                .write_record(&[
                    config.workload.to_string(),
                    config.threads.to_string(),
                    config.roots.to_string(),
                    config.local.to_string(),
                    config.sampling_period.as_millis().to_string(),
                    perf.ops_per_sec.to_string(),
                    perf.peak_mem.to_string(),
                    perf.avg_mem.to_string(),
                    perf.created.to_string(),
                    perf.dropped.to_string(),
                    config.interval.to_string(),
                ])
                .context("writing the result record")?;
            output.flush().context("flushing the result file")?;
        }
        Ok(())
    }
}

pub fn command() -> Command {
    Command::new("stress")
        .about("Hammers SharedHandle clones, moves and releases from many threads")
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("roots")
                .short('r')
                .value_parser(value_parser!(usize))
                .help("Number of shared payloads seeded before the run")
                .default_value("64"),
        )
        .arg(
            Arg::new("local")
                .short('l')
                .value_parser(value_parser!(usize))
                .help("Number of handles each thread keeps alive")
                .default_value("32"),
        )
        .arg(
            Arg::new("workload")
                .short('w')
                .value_parser(value_parser!(Workload))
                .ignore_case(true)
                .help("Operation mix")
                .default_value("balanced"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

/// Parses the process arguments. Exits on `--help` or malformed arguments.
pub fn setup() -> Result<(Config, BenchWriter)> {
    from_matches(&command().get_matches())
}

pub fn setup_from<I, T>(args: I) -> Result<(Config, BenchWriter)>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    from_matches(&command().try_get_matches_from(args)?)
}

fn from_matches(m: &ArgMatches) -> Result<(Config, BenchWriter)> {
    let threads = m.get_one::<usize>("threads").copied().unwrap_or_default();
    let interval = m.get_one::<u64>("interval").copied().unwrap_or_default();
    let roots = m.get_one::<usize>("roots").copied().unwrap_or_default();
    let local = m.get_one::<usize>("local").copied().unwrap_or_default();
    ensure!(threads > 0, "at least one thread is required");
    ensure!(interval > 0, "the interval must be at least one second");
    ensure!(roots > 0, "at least one root payload is required");
    ensure!(local > 0, "each thread needs at least one local handle");

    let workload = m
        .get_one::<Workload>("workload")
        .copied()
        .unwrap_or(Workload::Balanced);
    let sampling_period = m
        .get_one::<u64>("sampling period")
        .copied()
        .unwrap_or_default();
    let sampling = sampling_period > 0 && cfg!(all(not(feature = "sanitize"), target_os = "linux"));
    let op_dist = WeightedIndex::new(workload.weights()).context("invalid operation weights")?;

    let output = match m.get_one::<String>("output") {
        Some(output_name) => Some(open_output(Path::new(output_name))?),
        None => None,
    };

    let config = Config {
        workload,
        threads,
        roots,
        local,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        op_dist,
        root_dist: Uniform::from(0..roots),
        interval,
        duration: Duration::from_secs(interval),
        dry_run: m.get_flag("dry run"),
    };

    Ok((config, BenchWriter { output }))
}

fn open_output(output_path: &Path) -> Result<Writer<File>> {
    if let Some(dir) = output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    match OpenOptions::new().read(true).append(true).open(output_path) {
        Ok(f) => Ok(csv::Writer::from_writer(f)),
        Err(_) => {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(output_path)
                .with_context(|| format!("creating {}", output_path.display()))?;
            let mut output = csv::Writer::from_writer(f);
            // NOTE: must match `BenchWriter::write_record`
            output
                .write_record(HEADER)
                .context("writing the CSV header")?;
            output.flush()?;
            Ok(output)
        }
    }
}
