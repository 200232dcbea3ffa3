use std::path::PathBuf;

use anyhow::{Context, Result};
use crypto_selftrain::trainer::CancelFlag;
use crypto_selftrain::{BacktestArgs, RankArgs, TrainArgs, ValidateArgs, backtest, ranking, rules, trainer};

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Backtest(BacktestArgs),
    Validate(ValidateArgs),
    Rank(RankArgs),
    Train(TrainArgs),
}

fn apply_backtest_defaults(args: &mut BacktestArgs) {
    if args.csv.is_none() {
        args.csv = Some(PathBuf::from("./out/BTC.csv"));
    }
    if args.strategy.is_none() && args.rules.is_none() {
        args.strategy = Some("trend_momentum".to_string());
    }
    if args.ma_short.is_none() {
        args.ma_short = Some(5);
    }
    if args.ma_long.is_none() {
        args.ma_long = Some(15);
    }
    if args.min_signals.is_none() {
        args.min_signals = Some(2);
    }
}

fn apply_rank_defaults(args: &mut RankArgs) {
    if args.store.is_none() {
        args.store = Some(PathBuf::from("./state"));
    }
    if args.write.is_none() {
        args.write = Some(false);
    }
}

fn apply_train_defaults(args: &mut TrainArgs) {
    if args.store.is_none() {
        args.store = Some(PathBuf::from("./state"));
    }
    if args.source.is_none() {
        args.source = Some("csv".to_string());
    }
    if args.data.is_none() {
        args.data = Some(PathBuf::from("./out"));
    }
    if args.producer.is_none() {
        args.producer = Some("template".to_string());
    }
    if args.continuous.is_none() {
        args.continuous = Some(false);
    }
    if args.interval_minutes.is_none() {
        args.interval_minutes = Some(60);
    }
}

fn validate(args: &ValidateArgs) -> Result<()> {
    let path = args.rules.as_ref().context("--rules is required")?;
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    match rules::validate(&text) {
        Ok(program) => {
            println!("✅ {:?} compiles and passes the smoke test", path);
            println!(
                "   long rule: {}   short rule: {}",
                if program.has_long() { "yes" } else { "no" },
                if program.has_short() { "yes" } else { "no" }
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ {:?} rejected: {}", path, e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Backtest(mut backtest_args) => {
            apply_backtest_defaults(&mut backtest_args);
            backtest::execute(&backtest_args)?;
        }
        Command::Validate(validate_args) => validate(&validate_args)?,
        Command::Rank(mut rank_args) => {
            apply_rank_defaults(&mut rank_args);
            ranking::execute(&rank_args)?;
        }
        Command::Train(mut train_args) => {
            apply_train_defaults(&mut train_args);
            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight work");
                    on_signal.cancel();
                }
            });
            trainer::execute(&train_args, cancel).await?;
        }
    }
    Ok(())
}
