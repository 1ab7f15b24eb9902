use okx_stream::{
    core::kernel::{ChannelWs, ChannelWsHandle, WsConfig, WsTransport},
    exchanges::okx::{BarSize, Subscription, TransportFactory, WebSocketClient, WsStreamManager},
    LogSeverity,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stream manager whose sessions run over in-memory transports
fn create_test_manager() -> (WsStreamManager, Arc<Mutex<Vec<ChannelWsHandle>>>) {
    let handles = Arc::new(Mutex::new(Vec::new()));
    let sink = handles.clone();
    let factory: TransportFactory = Arc::new(move |_: &WsConfig| {
        let (transport, handle) = ChannelWs::pair();
        sink.lock().push(handle);
        Box::new(transport) as Box<dyn WsTransport>
    });

    let client = WebSocketClient::with_transport_factory(WsConfig::default(), factory)
        .expect("client should build");
    (WsStreamManager::with_client(client), handles)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

fn first_handle(handles: &Arc<Mutex<Vec<ChannelWsHandle>>>) -> ChannelWsHandle {
    wait_until(|| !handles.lock().is_empty());
    handles.lock()[0].clone()
}

fn ack(sub: &Subscription) -> String {
    json!({"event": "subscribe", "arg": sub}).to_string()
}

fn ticker_message(inst_id: &str, last: &str) -> String {
    json!({
        "arg": {"channel": "tickers", "instId": inst_id},
        "data": [{
            "instType": "SWAP",
            "instId": inst_id,
            "last": last,
            "lastSz": "0.1",
            "askPx": "3412.6",
            "askSz": "12",
            "bidPx": "3412.4",
            "bidSz": "30",
            "open24h": "3300",
            "high24h": "3450",
            "low24h": "3290",
            "volCcy24h": "51234.2",
            "vol24h": "5123420",
            "sodUtc0": "3350",
            "sodUtc8": "3320",
            "ts": "1700000000123"
        }]
    })
    .to_string()
}

fn candle_message(inst_id: &str, bar: BarSize, close: &str) -> String {
    json!({
        "arg": {"channel": bar.channel(), "instId": inst_id},
        "data": [["1700000000000", "10", "12", "9", close, "100", "1000", "11000", "0"]]
    })
    .to_string()
}

#[cfg(test)]
mod stream_manager_tests {
    use super::*;

    #[test]
    fn test_ticker_read_returns_decoded_event() {
        let (manager, handles) = create_test_manager();
        manager.subscribe_tickers_stream("ETH-USDT-SWAP").unwrap();
        assert!(manager.client().is_running());

        let handle = first_handle(&handles);
        wait_until(|| handle.sent_text().len() == 1);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&handle.sent_text()[0]).unwrap(),
            json!({"op": "subscribe", "args": [{"channel": "tickers", "instId": "ETH-USDT-SWAP"}]})
        );

        handle.push_text(ack(&Subscription::tickers("ETH-USDT-SWAP")));
        handle.push_text(ticker_message("ETH-USDT-SWAP", "3412.5"));

        let event = manager
            .read_event_instrument_info("ETH-USDT-SWAP")
            .expect("ticker should arrive");
        assert_eq!(event.tickers.len(), 1);
        assert_eq!(event.tickers[0].inst_id, "ETH-USDT-SWAP");
        assert_eq!(event.tickers[0].last, Decimal::new(34125, 1));
        assert_eq!(event.tickers[0].ts, 1_700_000_000_123);
    }

    #[test]
    fn test_later_ticker_overwrites_earlier() {
        let (manager, handles) = create_test_manager();
        manager.subscribe_tickers_stream("BTC-USDT").unwrap();

        let handle = first_handle(&handles);
        handle.push_text(ack(&Subscription::tickers("BTC-USDT")));
        handle.push_text(ticker_message("BTC-USDT", "100"));
        handle.push_text(ticker_message("BTC-USDT", "101"));

        wait_until(|| {
            manager.set_timeout(0);
            manager
                .read_event_instrument_info("BTC-USDT")
                .is_some_and(|event| event.tickers[0].last == Decimal::from(101))
        });
    }

    #[test]
    fn test_later_candle_overwrites_earlier() {
        let (manager, handles) = create_test_manager();
        manager
            .subscribe_candlestick_stream("BTC-USDT", BarSize::OneHour)
            .unwrap();

        let handle = first_handle(&handles);
        handle.push_text(ack(&Subscription::candles("BTC-USDT", BarSize::OneHour)));
        handle.push_text(candle_message("BTC-USDT", BarSize::OneHour, "11"));
        handle.push_text(candle_message("BTC-USDT", BarSize::OneHour, "12"));

        wait_until(|| {
            manager.set_timeout(0);
            manager
                .read_event_candlestick("BTC-USDT", BarSize::OneHour)
                .is_some_and(|event| event.candles[0].close == Decimal::from(12))
        });
        assert!(manager
            .read_event_candlestick("BTC-USDT", BarSize::OneMinute)
            .is_none());
    }

    #[test]
    fn test_read_for_unsubscribed_instrument_times_out() {
        let (manager, _handles) = create_test_manager();
        assert_eq!(manager.timeout(), 5);
        manager.set_timeout(1);

        let started = Instant::now();
        assert!(manager.read_event_instrument_info("DOGE-USDT").is_none());
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let (manager, _handles) = create_test_manager();
        manager.set_timeout(0);

        let started = Instant::now();
        assert!(manager
            .read_event_candlestick("BTC-USDT", BarSize::OneDay)
            .is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_blocked_read_wakes_on_first_event() {
        let (manager, handles) = create_test_manager();
        manager.subscribe_tickers_stream("SOL-USDT").unwrap();
        let handle = first_handle(&handles);
        handle.push_text(ack(&Subscription::tickers("SOL-USDT")));

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle.push_text(ticker_message("SOL-USDT", "150"));
        });

        let started = Instant::now();
        let event = manager.read_event_instrument_info("SOL-USDT");
        assert!(event.is_some());
        assert!(started.elapsed() < Duration::from_secs(4));
        writer.join().unwrap();
    }

    #[test]
    fn test_subscribing_logged_once_per_confirmed_subscription() {
        let (manager, handles) = create_test_manager();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        manager.set_logger_callback(Arc::new(move |severity, message| {
            if severity == LogSeverity::Info && message.starts_with("subscribing: ") {
                sink.lock().push(message.to_string());
            }
        }));

        manager.subscribe_tickers_stream("BTC-USDT").unwrap();
        let sub = Subscription::tickers("BTC-USDT");
        let handle = first_handle(&handles);
        handle.push_text(ack(&sub));
        wait_until(|| manager.client().is_subscribed(&sub));

        manager.subscribe_tickers_stream("BTC-USDT").unwrap();

        let messages = messages.lock();
        assert_eq!(
            *messages,
            vec![r#"subscribing: {"channel":"tickers","instId":"BTC-USDT"}"#.to_string()]
        );
        assert_eq!(handle.sent_text().len(), 1);
    }

    #[test]
    fn test_streams_share_one_connection() {
        let (manager, handles) = create_test_manager();
        manager.subscribe_tickers_stream("BTC-USDT").unwrap();
        manager
            .subscribe_candlestick_stream("BTC-USDT", BarSize::FiveMinutes)
            .unwrap();

        let handle = first_handle(&handles);
        wait_until(|| handle.sent_text().join("").contains("candle5m"));
        assert_eq!(handles.lock().len(), 1);
    }
}
