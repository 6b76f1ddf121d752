use anyhow::{anyhow, Context};
use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stream_common::data::types::{KlineInterval, Symbol};
use stream_core::{
    config::Settings,
    exchange::{Exchange, ExchangeRegistry, Provider},
    logging::init_tracing,
    stream::{FeedKind, MarketEvent, StreamClient, SubscriptionKey},
};

#[derive(Parser)]
#[command(name = "stream-core")]
#[command(about = "Real-time market data streams with order book resync")]
enum Commands {
    /// Print one live feed until Ctrl+C
    Watch {
        #[arg(short, long)]
        provider: Option<Provider>,
        #[arg(short, long, default_value = "ticker")]
        feed: String,
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(short, long, default_value = "10")]
        depth: u32,
        #[arg(short, long, default_value = "1m")]
        interval: KlineInterval,
    },
    /// Print the 24h ticker and recent candles from the REST API
    Quote {
        #[arg(short, long)]
        provider: Option<Provider>,
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(short, long, default_value = "1h")]
        interval: KlineInterval,
        #[arg(short, long, default_value = "5")]
        limit: u32,
    },
    /// List the exchange providers this build can create
    Providers,
}

fn parse_feed(feed: &str) -> anyhow::Result<FeedKind> {
    match feed.to_lowercase().as_str() {
        "ticker" => Ok(FeedKind::Ticker),
        "orderbook" | "book" | "depth" => Ok(FeedKind::OrderBook),
        "trade" | "trades" => Ok(FeedKind::Trade),
        "kline" | "candles" => Ok(FeedKind::Kline),
        other => Err(anyhow!("Unknown feed '{}'", other)),
    }
}

fn print_event(event: &MarketEvent) {
    match event {
        MarketEvent::Ticker(t) => println!(
            "{} last {} bid {} ask {} spread {}",
            t.symbol,
            t.last_price,
            t.bid_price,
            t.ask_price,
            t.spread()
        ),
        MarketEvent::Trade(t) => println!(
            "{} {} {} @ {}",
            t.timestamp.format("%H:%M:%S%.3f"),
            t.side,
            t.quantity,
            t.price
        ),
        MarketEvent::Kline(k) => println!(
            "{} {} o {} h {} l {} c {} v {}{}",
            k.symbol,
            k.interval,
            k.open,
            k.high,
            k.low,
            k.close,
            k.volume,
            if k.is_closed { " (closed)" } else { "" }
        ),
        MarketEvent::OrderBook(book) => {
            let bid = book.best_bid().map(|l| l.price.to_string());
            let ask = book.best_ask().map(|l| l.price.to_string());
            println!(
                "{} #{} bid {} ask {} spread {}",
                book.symbol,
                book.last_update_id,
                bid.unwrap_or_else(|| "-".into()),
                ask.unwrap_or_else(|| "-".into()),
                book.spread().map(|s| s.to_string()).unwrap_or_else(|| "-".into())
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let settings = Settings::new().context("Failed to load settings")?;
    init_tracing(&settings.logging).map_err(|e| anyhow!(e))?;

    let registry = ExchangeRegistry::with_defaults();
    let command = Commands::parse();

    match command {
        Commands::Providers => {
            for provider in registry.providers() {
                println!("{}", provider);
            }
        }

        Commands::Quote {
            provider,
            symbol,
            interval,
            limit,
        } => {
            let provider = provider.unwrap_or(settings.exchange.provider);
            let exchange = registry.create(provider, &settings.exchange.options())?;
            let symbol = Symbol::new(&symbol);

            let ticker = exchange.fetch_ticker(&symbol).await?;
            print_event(&MarketEvent::Ticker(ticker));

            for kline in exchange.fetch_klines(&symbol, interval, limit).await? {
                print_event(&MarketEvent::Kline(kline));
            }
        }

        Commands::Watch {
            provider,
            feed,
            symbol,
            depth,
            interval,
        } => {
            let provider = provider.unwrap_or(settings.exchange.provider);
            let exchange = registry.create(provider, &settings.exchange.options())?;
            let config = settings.stream.to_stream_config()?;
            let client = StreamClient::new(exchange, config)?;

            let key = match parse_feed(&feed)? {
                FeedKind::Ticker => SubscriptionKey::ticker(symbol.as_str()),
                FeedKind::OrderBook => SubscriptionKey::order_book(symbol.as_str(), depth),
                FeedKind::Trade => SubscriptionKey::trade(symbol.as_str()),
                FeedKind::Kline => SubscriptionKey::kline(symbol.as_str(), interval),
            };

            let subscription = client.market_stream(key.clone())?;
            let cancel = CancellationToken::new();
            let mut data = subscription.subscribe(&cancel)?;
            let mut errors = subscription
                .errors()
                .ok_or_else(|| anyhow!("Error channel already taken"))?;

            info!("Watching {} on {}. Press Ctrl+C to stop.", key, provider);

            let printer = tokio::spawn(async move {
                while let Some(event) = data.recv().await {
                    print_event(&event);
                }
            });
            let reporter = tokio::spawn(async move {
                while let Some(err) = errors.recv().await {
                    if err.is_terminal() {
                        error!("Stream ended: {}", err);
                    } else {
                        warn!("Stream error: {}", err);
                    }
                }
            });

            let done = subscription.done();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    cancel.cancel();
                }
                _ = done.clone().wait() => {}
            }

            done.wait().await;
            printer.await?;
            reporter.await?;
            info!("Stream closed, final stats: {:?}", subscription.stats());
        }
    }

    Ok(())
}
