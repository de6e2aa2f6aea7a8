use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use rand::Rng;
use range_breakout_bot::audit::jsonl::JsonlAuditSink;
use range_breakout_bot::audit::{AuditSink, CompositeAuditSink, TracingAuditSink};
use range_breakout_bot::execution::simulated::{SimConfig, SimulatedAdapter};
use range_breakout_bot::execution::ExecutionBoundary;
use range_breakout_bot::hydration::source::InMemoryBarSource;
use range_breakout_bot::risk::{FileKillSwitch, KillSwitch, StaticKillSwitch};
use range_breakout_bot::time::TimeService;
use range_breakout_bot::types::{Bar, BarSource, Instrument};
use range_breakout_bot::{Engine, EngineConfig, EngineDeps, Timetable};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Replays one trading day through the engine against the simulated broker.
#[derive(Parser, Debug)]
#[command(name = "bot")]
struct Args {
    #[arg(long, env = "RB_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "RB_TIMETABLE")]
    timetable: PathBuf,

    /// JSON-lines bar file; a synthetic random walk is used when absent.
    #[arg(long)]
    bars: Option<PathBuf>,

    /// `{"enabled": bool}` file. When omitted trading is allowed.
    #[arg(long, env = "RB_KILL_SWITCH")]
    kill_switch: Option<PathBuf>,

    #[arg(long)]
    journal_dir: Option<PathBuf>,

    #[arg(long)]
    audit_log: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Seed price for synthetic bars.
    #[arg(long, default_value_t = 5000.0)]
    start_price: f64,
}

fn load_bars(path: &Path) -> anyhow::Result<Vec<Bar>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading bars {}", path.display()))?;
    let mut bars = Vec::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let mut bar: Bar = serde_json::from_str(line).with_context(|| format!("bar line {}", n + 1))?;
        bar.source = BarSource::FileReplay;
        bars.push(bar);
    }
    bars.sort_by_key(|b| b.open_timestamp_utc);
    Ok(bars)
}

fn synthetic_bars(
    instrument: &Instrument,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    period: Duration,
    tick: f64,
    start: f64,
) -> Vec<Bar> {
    let mut rng = rand::thread_rng();
    let mut price = start;
    let mut bars = Vec::new();
    let mut ts = from;
    while ts < to {
        let open = price;
        let close = open + f64::from(rng.gen_range(-8i32..=8)) * tick;
        let high = open.max(close) + f64::from(rng.gen_range(0i32..=4)) * tick;
        let low = open.min(close) - f64::from(rng.gen_range(0i32..=4)) * tick;
        bars.push(Bar {
            instrument: instrument.clone(),
            open_timestamp_utc: ts,
            open,
            high,
            low,
            close,
            source: BarSource::Live,
        });
        price = close;
        ts += period;
    }
    bars
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let mut config: EngineConfig = serde_json::from_str(&text).context("parsing engine config")?;
    if let Some(dir) = args.journal_dir {
        config.journal_dir = dir;
    }
    let timetable = Timetable::load(&args.timetable)?;
    let time = TimeService::from_name(&config.timezone)?;
    let period = config.bar_period();

    let bars = match &args.bars {
        Some(path) => load_bars(path)?,
        None => {
            let mut bars = Vec::new();
            for spec in &config.instruments {
                let Some(session) = spec.sessions.first() else { continue };
                let from = time.local_to_utc(timetable.trading_date, session.range_start)?;
                let to = time.local_to_utc(timetable.trading_date, session.market_close)?;
                bars.extend(synthetic_bars(&spec.canonical, from, to, period, spec.tick_size, args.start_price));
            }
            bars.sort_by_key(|b| b.open_timestamp_utc);
            bars
        }
    };
    let Some(first) = bars.first() else {
        anyhow::bail!("no bars to replay");
    };
    let start = first.open_timestamp_utc;

    let boundary = Arc::new(ExecutionBoundary::new());
    let sim = Arc::new(SimulatedAdapter::new(boundary.clone(), SimConfig::default()));
    sim.set_clock(start);
    let kill_switch: Arc<dyn KillSwitch> = match args.kill_switch {
        Some(path) => Arc::new(FileKillSwitch::new(path)),
        None => Arc::new(StaticKillSwitch::new(false)),
    };
    let audit: Arc<dyn AuditSink> = match &args.audit_log {
        Some(path) => {
            let jsonl: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::open(path)?);
            Arc::new(CompositeAuditSink::new(vec![jsonl, Arc::new(TracingAuditSink)]))
        }
        None => Arc::new(TracingAuditSink),
    };
    // Every replayed bar doubles as history for restart reconstruction.
    let history = Arc::new(InMemoryBarSource::new(bars.clone()));

    let mut engine = Engine::new(
        config,
        EngineDeps {
            boundary,
            adapter: sim.clone(),
            kill_switch,
            bar_source: history,
            audit,
        },
    )?;

    let report = engine.apply_timetable(&timetable, start).await?;
    tracing::info!(
        created = report.created.len(),
        skipped = report.skipped.len(),
        "timetable applied"
    );
    engine.join_hydration().await;

    let mut now = start;
    for bar in &bars {
        now = bar.open_timestamp_utc + period;
        sim.set_clock(now);
        sim.on_bar(bar);
        engine.on_bar(bar, now).await;
        engine.tick(now).await;
    }
    // Carry the clock past every market close.
    let end_of_day = engine
        .streams()
        .map(|s| s.window().market_close)
        .max()
        .unwrap_or(now)
        .max(now);
    sim.set_clock(end_of_day);
    engine.tick(end_of_day).await;

    println!("{}", serde_json::to_string_pretty(&engine.stats_snapshot())?);
    Ok(())
}
