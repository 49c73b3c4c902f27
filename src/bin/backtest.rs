use anyhow::Result;
use clap::{Parser, ValueEnum};

use tradebot::backtest::{BacktestRunner, BarAction, PriceWalk, WalkScenario};
use tradebot::config::EngineConfig;
use tradebot::models::Side;
use tradebot::port::SimConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    Uptrend,
    Downtrend,
    Sideways,
    Volatile,
    Crash,
}

impl Scenario {
    fn walk(self) -> WalkScenario {
        match self {
            Scenario::Uptrend => WalkScenario::Trend { daily_drift: 0.02 },
            Scenario::Downtrend => WalkScenario::Trend { daily_drift: -0.02 },
            Scenario::Sideways => WalkScenario::Sideways,
            Scenario::Volatile => WalkScenario::Volatile,
            Scenario::Crash => WalkScenario::Crash,
        }
    }
}

/// Run the execution engine against a simulated market
#[derive(Parser, Debug)]
#[command(name = "backtest")]
struct Args {
    /// Market scenario to generate
    #[arg(long, value_enum, default_value = "sideways")]
    scenario: Scenario,

    /// Number of bars to simulate
    #[arg(long, default_value_t = 2000)]
    bars: usize,

    /// Bar interval in minutes
    #[arg(long, default_value_t = 5)]
    interval: i64,

    /// RNG seed (walk and fills)
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Starting cash balance
    #[arg(long, default_value_t = 10_000.0)]
    balance: f64,

    /// Fee rate per fill (0.001 = 10 bps)
    #[arg(long, default_value_t = 0.001)]
    fee_rate: f64,

    /// Std dev of market-order slippage
    #[arg(long, default_value_t = 0.0005)]
    slippage: f64,

    /// Units per bracket entry
    #[arg(long, default_value_t = 1.0)]
    size: f64,

    /// Stop-loss distance from entry, fractional
    #[arg(long, default_value_t = 0.04)]
    stop_pct: f64,

    /// Take-profit distance from entry, fractional
    #[arg(long, default_value_t = 0.06)]
    target_pct: f64,

    /// Re-enter a bracket this many bars after going flat
    #[arg(long, default_value_t = 12)]
    entry_every: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tradebot=info".to_string()),
        )
        .init();

    let args = Args::parse();
    tracing::info!(scenario = ?args.scenario, bars = args.bars, seed = args.seed, "generating market");

    let candles = PriceWalk::new(args.seed).generate(
        "SYNTH",
        args.scenario.walk(),
        args.bars,
        args.interval,
    );

    let sim_config = SimConfig {
        initial_cash: args.balance,
        fee_rate: args.fee_rate,
        slippage_std_dev: args.slippage,
        ..SimConfig::default()
    };
    let engine_config = EngineConfig::load()?;
    let runner = BacktestRunner::new(sim_config, engine_config, args.seed);

    let size = args.size;
    let stop_pct = args.stop_pct;
    let target_pct = args.target_pct;
    let entry_every = args.entry_every.max(1);

    let report = runner
        .run("SYNTH", &candles, |i, bar, position| {
            // When flat, periodically enter a protected long
            if position.is_none() && i % entry_every == 0 {
                vec![BarAction::Bracket {
                    side: Side::Buy,
                    size,
                    stop_loss: bar.close * (1.0 - stop_pct),
                    take_profit: bar.close * (1.0 + target_pct),
                }]
            } else {
                vec![]
            }
        })
        .await?;

    report.print_report();
    Ok(())
}
