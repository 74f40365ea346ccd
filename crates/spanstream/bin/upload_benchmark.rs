//! Upload benchmark: paced multi-threaded span generation through a
//! recorder into a satellite, with a sanity check over what arrived.
//!
//! Exits 0 on a clean run, 1 when the sanity check fails.

use clap::Parser;
use spanstream::{
    DummySatellite, MetricsObserver, RecorderOptions, SatelliteEndpoint, SpanRecord,
    StreamRecorder, TagValue,
};
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Benchmark span upload throughput against a satellite")]
struct Args {
    /// Total spans to generate across all threads.
    #[arg(long, default_value_t = 1000)]
    num_spans: usize,

    /// Producer threads.
    #[arg(long, default_value_t = 1)]
    num_threads: usize,

    /// Per-thread span rate cap.
    #[arg(long, default_value_t = 1000.0)]
    max_spans_per_second: f64,

    /// Ring capacity, in spans.
    #[arg(long, default_value_t = 2000)]
    max_buffered_spans: usize,

    /// Send to an already-running satellite on this port instead of the
    /// embedded dummy (disables the sanity check).
    #[arg(long)]
    satellite_port: Option<u16>,

    /// Emit per-drop diagnostics.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

struct DropCounter(AtomicU64);

impl MetricsObserver for DropCounter {
    fn on_spans_dropped(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn generate_spans(
    recorder: &StreamRecorder,
    thread: usize,
    num_spans: usize,
    min_span_elapse: Duration,
) -> Vec<u64> {
    let mut ids = Vec::with_capacity(num_spans);
    let start = Instant::now();
    for seq in 0..num_spans {
        let id = ((thread as u64) << 48) | (seq as u64 + 1);
        ids.push(id);
        let mut span = SpanRecord::new(thread as u64 + 1, id, "abc");
        span.start_timestamp_micros = now_micros();
        span.set_tag("thread", TagValue::Int(thread as i64));
        recorder.record_span(&span);

        let next = min_span_elapse * (seq as u32 + 1);
        let elapsed = start.elapsed();
        if next > elapsed {
            std::thread::sleep(next - elapsed);
        }
    }
    ids
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut embedded = None;
    let satellite_port = match args.satellite_port {
        Some(port) => port,
        None => {
            let satellite = match DummySatellite::bind() {
                Ok(satellite) => satellite,
                Err(err) => {
                    eprintln!("failed to start the embedded satellite: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let port = satellite.port();
            embedded = Some(satellite);
            port
        }
    };

    let observer = Arc::new(DropCounter(AtomicU64::new(0)));
    let options = RecorderOptions {
        component_name: "upload_benchmark".into(),
        access_token: "benchmark".into(),
        satellite_endpoints: vec![SatelliteEndpoint {
            host: "127.0.0.1".into(),
            port: satellite_port,
            family: Default::default(),
        }],
        max_buffered_spans: args.max_buffered_spans,
        polling_period: Duration::from_millis(2),
        flushing_period: Some(Duration::from_millis(50)),
        verbose: args.verbose,
        metrics_observer: Some(observer.clone()),
        ..RecorderOptions::default()
    };
    let recorder = match StreamRecorder::new(options) {
        Ok(recorder) => Arc::new(recorder),
        Err(err) => {
            eprintln!("failed to construct the recorder: {err}");
            return ExitCode::FAILURE;
        }
    };

    let threads = args.num_threads.max(1);
    let spans_per_thread = args.num_spans / threads;
    let remainder = args.num_spans - spans_per_thread * threads;
    let min_span_elapse = Duration::from_secs_f64(1.0 / args.max_spans_per_second);

    let start = Instant::now();
    let mut handles = Vec::new();
    for thread in 0..threads {
        let recorder = Arc::clone(&recorder);
        let count = spans_per_thread + usize::from(thread < remainder);
        handles.push(std::thread::spawn(move || {
            generate_spans(&recorder, thread, count, min_span_elapse)
        }));
    }
    let mut sent_ids = Vec::with_capacity(args.num_spans);
    for handle in handles {
        match handle.join() {
            Ok(ids) => sent_ids.extend(ids),
            Err(_) => {
                eprintln!("producer thread panicked");
                return ExitCode::FAILURE;
            }
        }
    }
    let elapsed = start.elapsed();

    // Close so the satellite observes EOF on every stream.
    recorder.close();
    let num_dropped = recorder.num_spans_dropped();

    let total = sent_ids.len();
    let expected_received = total as u64 - num_dropped;
    println!("total spans:       {total}");
    println!("spans dropped:     {num_dropped}");
    println!("elapsed:           {:.3}s", elapsed.as_secs_f64());
    println!(
        "spans per second:  {:.1}",
        total as f64 / elapsed.as_secs_f64()
    );
    debug_assert_eq!(observer.0.load(Ordering::Relaxed), num_dropped);

    let Some(mut satellite) = embedded else {
        return ExitCode::SUCCESS;
    };
    // Give the satellite a moment to drain its sockets.
    let settle = Instant::now();
    while (satellite.num_spans_received() as u64) < expected_received
        && settle.elapsed() < Duration::from_secs(5)
    {
        std::thread::sleep(Duration::from_millis(20));
    }
    satellite.close();

    let received_ids = satellite.span_ids();
    println!("spans received:    {}", received_ids.len());
    println!("reported dropped:  {}", satellite.reported_dropped());

    // Sanity: every received id was sent, and the counts line up.
    let sent: HashSet<u64> = sent_ids.iter().copied().collect();
    for id in &received_ids {
        if !sent.contains(id) {
            eprintln!("upload error: span id {id:#x} was never sent");
            return ExitCode::FAILURE;
        }
    }
    if received_ids.len() as u64 != expected_received {
        eprintln!(
            "upload error: expected {expected_received} spans at the satellite, found {}",
            received_ids.len()
        );
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
