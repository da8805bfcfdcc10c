use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use mdsync_rs::config::StreamConfig;
use mdsync_rs::market_data::adapters::upbit::{UpbitAdapter, UpbitMarkets};
use mdsync_rs::stream::StreamClient;
use mdsync_rs::telemetry;
use mdsync_rs::StreamError;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Channel {
    Ticker,
    Trades,
    Orderbook,
    Ohlcv,
    Orders,
    MyTrades,
    Balance,
}

/// Stream Upbit market data and print each update.
#[derive(Debug, Parser)]
#[command(name = "mdsync", version)]
struct Args {
    /// Unified symbol, e.g. BTC/KRW
    #[arg(long, default_value = "BTC/KRW")]
    symbol: String,

    #[arg(long, value_enum, default_value = "orderbook")]
    channel: Channel,

    /// Watch orders / my-trades across every market instead of --symbol
    #[arg(long)]
    all_markets: bool,

    /// Order book levels to print per side
    #[arg(long, default_value_t = 5)]
    levels: usize,

    /// Config file (TOML/JSON/YAML); MDSYNC__* env vars override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,

    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

impl Args {
    fn private_scope(&self) -> Option<&str> {
        (!self.all_markets).then_some(self.symbol.as_str())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let args = Args::parse();
    telemetry::init_tracing(&args.log);
    telemetry::init_metrics(args.metrics_port)?;

    let cfg = StreamConfig::load(args.config.as_deref())?;
    let adapter = UpbitAdapter::with_url(&cfg.upbit.ws_url()).with_token(cfg.upbit.token.clone());
    let markets = UpbitMarkets::new(&cfg.upbit.rest_url());
    let client = StreamClient::new(Arc::new(adapter), Arc::new(markets), cfg.client_options());

    let loaded = client.load_markets().await?;
    info!(markets = loaded, symbol = %args.symbol, channel = ?args.channel, "Starting stream");

    tokio::select! {
        res = run(&client, &args) => res?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    client.close();
    Ok(())
}

async fn run(client: &StreamClient, args: &Args) -> anyhow::Result<()> {
    let symbol = args.symbol.as_str();
    loop {
        let res = match args.channel {
            Channel::Ticker => client.watch_ticker(symbol).await.map(|t| {
                println!(
                    "{} last={:?} change={:?}% vol24h={:?}",
                    t.symbol, t.last, t.percentage, t.base_volume
                );
            }),
            Channel::Trades => client.watch_trades(symbol, None, None).await.map(|trades| {
                for t in trades {
                    println!("{} {:?} {} @ {} [{:?}]", t.symbol, t.side, t.amount, t.price, t.timestamp);
                }
            }),
            Channel::Orderbook => client.watch_order_book(symbol, Some(args.levels)).await.map(|book| {
                match (book.best_bid(), book.best_ask()) {
                    (Some((bp, bs)), Some((ap, asz))) => println!(
                        "BBO {}: BID {:.8} @ {} | ASK {:.8} @ {} | Spread: {:.8}",
                        book.symbol, bp, bs, ap, asz, ap - bp
                    ),
                    _ => println!("BBO {}: No data available", book.symbol),
                }
            }),
            Channel::Ohlcv => client.watch_ohlcv(symbol, "1s", None, None).await.map(|candles| {
                for c in candles {
                    println!("{} {} o={} h={} l={} c={} v={}", c.symbol, c.timestamp, c.open, c.high, c.low, c.close, c.volume);
                }
            }),
            Channel::Orders => client.watch_orders(args.private_scope(), None, None).await.map(|orders| {
                for o in orders {
                    println!("{} {} {:?} {:?} filled={:?}/{:?}", o.symbol, o.id, o.side, o.status, o.filled, o.amount);
                }
            }),
            Channel::MyTrades => client.watch_my_trades(args.private_scope(), None, None).await.map(|trades| {
                for t in trades {
                    println!("{} order={:?} {:?} {} @ {} fee={:?}", t.symbol, t.order, t.side, t.amount, t.price, t.fee);
                }
            }),
            Channel::Balance => client.watch_balance().await.map(|b| {
                for (currency, entry) in &b.assets {
                    println!("{currency}: free={} used={} total={}", entry.free, entry.used, entry.total);
                }
            }),
        };

        match res {
            Ok(()) => {}
            Err(e @ StreamError::Timeout { .. }) => warn!(error = %e, "No update yet"),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_channels_follow_symbol() {
        let args = Args::try_parse_from(["mdsync", "--channel", "orders", "--symbol", "ETH/KRW"]).unwrap();
        assert_eq!(args.private_scope(), Some("ETH/KRW"));

        let args = Args::try_parse_from(["mdsync", "--channel", "my-trades", "--all-markets"]).unwrap();
        assert_eq!(args.private_scope(), None);
    }
}
