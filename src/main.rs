use anyhow::Context;
use okx_stream::exchanges::okx::BarSize;
use okx_stream::OkxBuilder;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let inst_id = args.next().unwrap_or_else(|| "BTC-USDT".to_string());
    let bar: Option<BarSize> = args
        .next()
        .map(|bar| bar.parse().map_err(anyhow::Error::msg))
        .transpose()
        .context("invalid bar size")?;

    let manager = OkxBuilder::from_env()
        .build_stream_manager()
        .context("failed to create stream manager")?;

    manager.subscribe_tickers_stream(&inst_id)?;
    if let Some(bar) = bar {
        manager.subscribe_candlestick_stream(&inst_id, bar)?;
    }

    loop {
        match manager.read_event_instrument_info(&inst_id) {
            Some(event) => {
                for ticker in event.tickers {
                    println!(
                        "{} last={} bid={} ask={} ts={}",
                        ticker.inst_id, ticker.last, ticker.bid_px, ticker.ask_px, ticker.ts
                    );
                }
            }
            None => println!("no ticker for {} within {}s", inst_id, manager.timeout()),
        }

        if let Some(event) = bar.and_then(|bar| manager.read_event_candlestick(&inst_id, bar)) {
            if let Some(candle) = event.candles.first() {
                println!(
                    "{} {} o={} h={} l={} c={} confirmed={}",
                    inst_id, candle.ts, candle.open, candle.high, candle.low, candle.close,
                    candle.confirm
                );
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}
