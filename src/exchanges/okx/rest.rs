use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::exchanges::okx::types::{
    AccountBalance, BarSize, Candle, FundingRate, Instrument, InstrumentType, OkxResponse,
    Position, ServerTime, Ticker,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://www.okx.com";

/// Upper bound of the `limit` parameter on candle endpoints
pub const MAX_CANDLES_PER_PAGE: u32 = 100;

/// Upper bound of the `limit` parameter on funding rate history
pub const MAX_FUNDING_RATES_PER_PAGE: u32 = 100;

/// OKX market data limit: 20 requests per 2 seconds
pub fn default_quota() -> Quota {
    Quota::per_second(nonzero!(10u32)).allow_burst(nonzero!(20u32))
}

/// OKX REST API client implementation
pub struct OkxRest<R: RestClient> {
    rest_client: R,
    limiter: DefaultDirectRateLimiter,
    instruments: RwLock<HashMap<InstrumentType, Vec<Instrument>>>,
}

impl<R: RestClient> fmt::Debug for OkxRest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OkxRest").finish_non_exhaustive()
    }
}

impl<R: RestClient> OkxRest<R> {
    pub fn new(rest_client: R) -> Self {
        Self::with_quota(rest_client, default_quota())
    }

    pub fn with_quota(rest_client: R, quota: Quota) -> Self {
        Self {
            rest_client,
            limiter: RateLimiter::direct(quota),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    /// Maps OKX error codes to `ExchangeError` variants by code family
    fn map_okx_error(code: &str, message: &str) -> ExchangeError {
        let numeric: i32 = code.parse().unwrap_or(-1);

        match numeric {
            50011 | 50061 => ExchangeError::RateLimitExceeded(format!(
                "OKX rate limit exceeded: {} - {}",
                code, message
            )),
            50100..=50119 => ExchangeError::AuthError(format!("{} - {}", code, message)),
            50001 | 50004 | 50013 | 50026 => {
                ExchangeError::ServerError(format!("OKX server error: {} - {}", code, message))
            }
            51000..=51099 => ExchangeError::InvalidParameters(format!(
                "Invalid parameter: {} - {}",
                code, message
            )),
            _ => ExchangeError::ApiError {
                code: numeric,
                message: message.to_string(),
            },
        }
    }

    /// Unwrap the `{code, msg, data}` envelope
    fn handle_response<T>(response_value: Value) -> Result<T, ExchangeError>
    where
        T: DeserializeOwned,
    {
        let response: OkxResponse<Value> = serde_json::from_value(response_value).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to parse OKX response: {}", e))
        })?;

        if response.code != "0" {
            return Err(Self::map_okx_error(&response.code, &response.msg));
        }

        serde_json::from_value(response.data).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to parse OKX data: {}", e))
        })
    }

    fn first_item<T>(items: Vec<T>, what: &str) -> Result<T, ExchangeError> {
        items
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::ParseError(format!("Empty {} response", what)))
    }

    async fn get<T>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ExchangeError>
    where
        T: DeserializeOwned,
    {
        self.limiter.until_ready().await;
        let value = self
            .rest_client
            .get(endpoint, query_params, authenticated)
            .await?;
        Self::handle_response(value)
    }

    /// Server time in milliseconds
    pub async fn get_system_time(&self) -> Result<i64, ExchangeError> {
        let items: Vec<ServerTime> = self.get("/api/v5/public/time", &[], false).await?;
        Self::first_item(items, "system time").map(|time| time.ts)
    }

    #[instrument(skip(self))]
    pub async fn get_tickers(&self, inst_type: InstrumentType) -> Result<Vec<Ticker>, ExchangeError> {
        self.get(
            "/api/v5/market/tickers",
            &[("instType", inst_type.as_str())],
            false,
        )
        .await
    }

    pub async fn get_ticker(&self, inst_id: &str) -> Result<Ticker, ExchangeError> {
        let items: Vec<Ticker> = self
            .get("/api/v5/market/ticker", &[("instId", inst_id)], false)
            .await?;
        Self::first_item(items, "ticker")
    }

    /// Most recent candles, oldest first
    #[instrument(skip(self))]
    pub async fn get_candles(
        &self,
        inst_id: &str,
        bar: BarSize,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let limit = limit.unwrap_or(MAX_CANDLES_PER_PAGE).min(MAX_CANDLES_PER_PAGE);
        let limit_str = limit.to_string();
        let mut candles: Vec<Candle> = self
            .get(
                "/api/v5/market/candles",
                &[
                    ("instId", inst_id),
                    ("bar", bar.as_str()),
                    ("limit", limit_str.as_str()),
                ],
                false,
            )
            .await?;

        candles.sort_by_key(|candle| candle.ts);
        Ok(candles)
    }

    /// Records with `from <= ts < to`, oldest first.
    ///
    /// Pages backwards from `to`; each page asks for records older than the
    /// oldest one seen so far, and paging stops at the window start or on an
    /// empty page.
    async fn page_backwards<T, F>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        from: i64,
        to: i64,
        limit: u32,
        ts_of: F,
    ) -> Result<Vec<T>, ExchangeError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> i64,
    {
        if from >= to {
            return Ok(Vec::new());
        }

        let limit_str = limit.to_string();
        // `before` is exclusive
        let before = (from - 1).to_string();
        let mut cursor = to;
        let mut collected: Vec<T> = Vec::new();

        loop {
            let after = cursor.to_string();
            let mut query: Vec<(&str, &str)> = params.to_vec();
            query.extend([
                ("after", after.as_str()),
                ("before", before.as_str()),
                ("limit", limit_str.as_str()),
            ]);

            let page: Vec<T> = self.get(endpoint, &query, false).await?;

            let Some(oldest) = page.iter().map(&ts_of).min() else {
                break;
            };
            debug!(endpoint, count = page.len(), oldest, "history page");

            collected.extend(page.into_iter().filter(|item| {
                let ts = ts_of(item);
                ts >= from && ts < to
            }));

            if oldest <= from || oldest >= cursor {
                break;
            }
            cursor = oldest;
        }

        collected.sort_by_key(|item| ts_of(item));
        collected.dedup_by_key(|item| ts_of(item));
        Ok(collected)
    }

    /// Confirmed candles with `from <= ts < to`, oldest first
    #[instrument(skip(self))]
    pub async fn get_history_candles(
        &self,
        inst_id: &str,
        bar: BarSize,
        from: i64,
        to: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let limit = limit.unwrap_or(MAX_CANDLES_PER_PAGE).min(MAX_CANDLES_PER_PAGE);
        let mut candles = self
            .page_backwards(
                "/api/v5/market/history-candles",
                &[("instId", inst_id), ("bar", bar.as_str())],
                from,
                to,
                limit,
                |candle: &Candle| candle.ts,
            )
            .await?;

        candles.retain(|candle| candle.confirm);
        Ok(candles)
    }

    /// Instruments of one type, served from the cache unless `force` is set
    /// or nothing is cached for that type yet
    #[instrument(skip(self))]
    pub async fn get_instruments(
        &self,
        inst_type: InstrumentType,
        force: bool,
    ) -> Result<Vec<Instrument>, ExchangeError> {
        if !force {
            if let Some(cached) = self.instruments.read().get(&inst_type) {
                return Ok(cached.clone());
            }
        }

        let instruments: Vec<Instrument> = self
            .get(
                "/api/v5/public/instruments",
                &[("instType", inst_type.as_str())],
                false,
            )
            .await?;

        self.instruments
            .write()
            .insert(inst_type, instruments.clone());
        Ok(instruments)
    }

    /// Replace the cached instruments of every type present in `instruments`
    pub fn set_instruments(&self, instruments: Vec<Instrument>) {
        let mut grouped: HashMap<InstrumentType, Vec<Instrument>> = HashMap::new();
        for instrument in instruments {
            grouped
                .entry(instrument.inst_type)
                .or_default()
                .push(instrument);
        }

        self.instruments.write().extend(grouped);
    }

    /// Current funding rate of a perpetual swap
    pub async fn get_last_funding_rate(&self, inst_id: &str) -> Result<FundingRate, ExchangeError> {
        let items: Vec<FundingRate> = self
            .get("/api/v5/public/funding-rate", &[("instId", inst_id)], false)
            .await?;
        Self::first_item(items, "funding rate")
    }

    /// Funding rates with `from <= fundingTime < to`, oldest first
    #[instrument(skip(self))]
    pub async fn get_funding_rates(
        &self,
        inst_id: &str,
        from: i64,
        to: i64,
        limit: Option<u32>,
    ) -> Result<Vec<FundingRate>, ExchangeError> {
        let limit = limit
            .unwrap_or(MAX_FUNDING_RATES_PER_PAGE)
            .min(MAX_FUNDING_RATES_PER_PAGE);
        self.page_backwards(
            "/api/v5/public/funding-rate-history",
            &[("instId", inst_id)],
            from,
            to,
            limit,
            |rate: &FundingRate| rate.funding_time,
        )
        .await
    }

    /// Open positions of one instrument type, optionally for one instrument
    pub async fn get_positions(
        &self,
        inst_type: InstrumentType,
        inst_id: Option<&str>,
    ) -> Result<Vec<Position>, ExchangeError> {
        let mut params = vec![("instType", inst_type.as_str())];
        if let Some(inst_id) = inst_id {
            params.push(("instId", inst_id));
        }
        self.get("/api/v5/account/positions", &params, true).await
    }

    /// Trading account balance, optionally for one currency
    pub async fn get_balance(&self, ccy: Option<&str>) -> Result<AccountBalance, ExchangeError> {
        let params: Vec<(&str, &str)> = ccy.map(|ccy| vec![("ccy", ccy)]).unwrap_or_default();
        let items: Vec<AccountBalance> = self
            .get("/api/v5/account/balance", &params, true)
            .await?;
        Self::first_item(items, "balance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::Method;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        endpoint: String,
        params: Vec<(String, String)>,
        authenticated: bool,
    }

    #[derive(Default)]
    struct MockRest {
        responses: Mutex<VecDeque<Value>>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockRest {
        fn with_responses(responses: Vec<Value>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn param(call: &Call, key: &str) -> Option<String> {
            call.params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[async_trait]
    impl RestClient for MockRest {
        async fn get(
            &self,
            endpoint: &str,
            query_params: &[(&str, &str)],
            authenticated: bool,
        ) -> Result<Value, ExchangeError> {
            self.calls.lock().push(Call {
                endpoint: endpoint.to_string(),
                params: query_params
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                authenticated,
            });
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| ExchangeError::NetworkError("no canned response".to_string()))
        }

        async fn signed_request(
            &self,
            _method: Method,
            _endpoint: &str,
            _query_params: &[(&str, &str)],
            _body: &[u8],
        ) -> Result<Value, ExchangeError> {
            Err(ExchangeError::Other("not used".to_string()))
        }
    }

    fn ok(data: Value) -> Value {
        json!({"code": "0", "msg": "", "data": data})
    }

    fn row(ts: i64, close: &str, confirm: &str) -> Value {
        json!([ts.to_string(), "1", "2", "0.5", close, "10", "10", "15", confirm])
    }

    #[tokio::test]
    async fn test_system_time() {
        let rest = OkxRest::new(MockRest::with_responses(vec![ok(
            json!([{"ts": "1700000000000"}]),
        )]));

        assert_eq!(rest.get_system_time().await.unwrap(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_error_envelope_maps_by_code_family() {
        let rest = OkxRest::new(MockRest::with_responses(vec![
            json!({"code": "50011", "msg": "Too Many Requests", "data": []}),
            json!({"code": "50111", "msg": "Invalid OK-ACCESS-KEY", "data": []}),
            json!({"code": "51001", "msg": "Instrument ID does not exist", "data": []}),
            json!({"code": "58350", "msg": "Insufficient balance", "data": []}),
        ]));

        assert!(matches!(
            rest.get_system_time().await,
            Err(ExchangeError::RateLimitExceeded(_))
        ));
        assert!(matches!(
            rest.get_balance(None).await,
            Err(ExchangeError::AuthError(_))
        ));
        assert!(matches!(
            rest.get_ticker("NOPE").await,
            Err(ExchangeError::InvalidParameters(_))
        ));
        assert!(matches!(
            rest.get_ticker("BTC-USDT").await,
            Err(ExchangeError::ApiError { code: 58350, .. })
        ));
    }

    #[tokio::test]
    async fn test_candles_are_sorted_ascending() {
        let mock = MockRest::with_responses(vec![ok(json!([
            row(3_000, "13", "0"),
            row(2_000, "12", "1"),
            row(1_000, "11", "1"),
        ]))]);
        let rest = OkxRest::new(mock);

        let candles = rest
            .get_candles("BTC-USDT", BarSize::OneMinute, Some(500))
            .await
            .unwrap();

        let ts: Vec<i64> = candles.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![1_000, 2_000, 3_000]);
        assert_eq!(candles[2].close, Decimal::from(13));

        let calls = rest.rest_client.calls.lock();
        assert_eq!(MockRest::param(&calls[0], "limit").as_deref(), Some("100"));
        assert_eq!(MockRest::param(&calls[0], "bar").as_deref(), Some("1m"));
    }

    #[tokio::test]
    async fn test_history_candles_walk_back_to_window_start() {
        let mock = MockRest::with_responses(vec![
            ok(json!([row(9_000, "9", "1"), row(8_000, "8", "1"), row(7_000, "7", "1")])),
            ok(json!([row(6_000, "6", "1"), row(5_000, "5", "0"), row(4_000, "4", "1")])),
            ok(json!([row(3_000, "3", "1"), row(2_000, "2", "1")])),
        ]);
        let rest = OkxRest::new(mock);

        let candles = rest
            .get_history_candles("BTC-USDT", BarSize::OneMinute, 3_000, 10_000, Some(3))
            .await
            .unwrap();

        let ts: Vec<i64> = candles.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![3_000, 4_000, 6_000, 7_000, 8_000, 9_000]);

        let calls = rest.rest_client.calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(MockRest::param(&calls[0], "after").as_deref(), Some("10000"));
        assert_eq!(MockRest::param(&calls[1], "after").as_deref(), Some("7000"));
        assert_eq!(MockRest::param(&calls[2], "after").as_deref(), Some("4000"));
        assert_eq!(MockRest::param(&calls[0], "before").as_deref(), Some("2999"));
    }

    #[tokio::test]
    async fn test_history_candles_stop_on_empty_page_or_empty_window() {
        let rest = OkxRest::new(MockRest::with_responses(vec![
            ok(json!([row(9_000, "9", "1")])),
            ok(json!([])),
        ]));

        let candles = rest
            .get_history_candles("BTC-USDT", BarSize::OneMinute, 0, 10_000, None)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(rest.rest_client.calls.lock().len(), 2);

        let none = rest
            .get_history_candles("BTC-USDT", BarSize::OneMinute, 10_000, 10_000, None)
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(rest.rest_client.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_balance_is_authenticated() {
        let rest = OkxRest::new(MockRest::with_responses(vec![ok(json!([{
            "totalEq": "1000.5",
            "adjEq": "",
            "uTime": "1700000000000",
            "details": [{"ccy": "USDT", "eq": "1000.5", "availBal": "900", "uTime": "1700000000000"}]
        }]))]));

        let balance = rest.get_balance(Some("USDT")).await.unwrap();
        assert_eq!(balance.total_eq, Decimal::new(10005, 1));
        assert_eq!(balance.adj_eq, Decimal::ZERO);
        assert_eq!(balance.details[0].avail_bal, Decimal::from(900));

        let calls = rest.rest_client.calls.lock();
        assert!(calls[0].authenticated);
        assert_eq!(MockRest::param(&calls[0], "ccy").as_deref(), Some("USDT"));
    }

    fn instrument(inst_type: &str, inst_id: &str) -> Value {
        json!({"instType": inst_type, "instId": inst_id, "tickSz": "0.1", "lotSz": "1"})
    }

    fn funding(ts: i64, rate: &str) -> Value {
        json!({
            "instType": "SWAP",
            "instId": "BTC-USDT-SWAP",
            "fundingRate": rate,
            "realizedRate": rate,
            "fundingTime": ts.to_string()
        })
    }

    #[tokio::test]
    async fn test_instruments_are_cached_per_type() {
        let rest = OkxRest::new(MockRest::with_responses(vec![
            ok(json!([instrument("SWAP", "BTC-USDT-SWAP")])),
            ok(json!([instrument("SWAP", "BTC-USDT-SWAP"), instrument("SWAP", "ETH-USDT-SWAP")])),
            ok(json!([instrument("SPOT", "BTC-USDT")])),
        ]));

        let first = rest.get_instruments(InstrumentType::Swap, false).await.unwrap();
        let cached = rest.get_instruments(InstrumentType::Swap, false).await.unwrap();
        assert_eq!(first, cached);
        assert_eq!(rest.rest_client.calls.lock().len(), 1);

        let forced = rest.get_instruments(InstrumentType::Swap, true).await.unwrap();
        assert_eq!(forced.len(), 2);

        let spot = rest.get_instruments(InstrumentType::Spot, false).await.unwrap();
        assert_eq!(spot[0].inst_id, "BTC-USDT");

        let calls = rest.rest_client.calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].endpoint, "/api/v5/public/instruments");
        assert_eq!(MockRest::param(&calls[2], "instType").as_deref(), Some("SPOT"));
    }

    #[tokio::test]
    async fn test_set_instruments_fills_the_cache() {
        let rest = OkxRest::new(MockRest::default());
        let instruments: Vec<Instrument> = serde_json::from_value(json!([
            instrument("FUTURES", "BTC-USD-240329"),
            instrument("SPOT", "ETH-USDT"),
        ]))
        .unwrap();

        rest.set_instruments(instruments);

        let futures = rest
            .get_instruments(InstrumentType::Futures, false)
            .await
            .unwrap();
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].tick_sz, Decimal::new(1, 1));
        assert!(rest.rest_client.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_last_funding_rate() {
        let rest = OkxRest::new(MockRest::with_responses(vec![ok(json!([{
            "instType": "SWAP",
            "instId": "BTC-USDT-SWAP",
            "fundingRate": "0.0001",
            "nextFundingRate": "",
            "fundingTime": "1700006400000",
            "nextFundingTime": "1700035200000",
            "settState": "processing"
        }]))]));

        let rate = rest.get_last_funding_rate("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(rate.funding_rate, Decimal::new(1, 4));
        assert_eq!(rate.next_funding_rate, Decimal::ZERO);
        assert_eq!(rate.funding_time, 1_700_006_400_000);

        let calls = rest.rest_client.calls.lock();
        assert_eq!(calls[0].endpoint, "/api/v5/public/funding-rate");
        assert!(!calls[0].authenticated);
    }

    #[tokio::test]
    async fn test_funding_rates_walk_back_to_window_start() {
        let rest = OkxRest::new(MockRest::with_responses(vec![
            ok(json!([funding(9_000, "0.3"), funding(8_000, "0.2")])),
            ok(json!([funding(7_000, "0.1"), funding(6_000, "0.05")])),
        ]));

        let rates = rest
            .get_funding_rates("BTC-USDT-SWAP", 7_000, 9_000, Some(2))
            .await
            .unwrap();

        let ts: Vec<i64> = rates.iter().map(|r| r.funding_time).collect();
        assert_eq!(ts, vec![7_000, 8_000]);

        let calls = rest.rest_client.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].endpoint, "/api/v5/public/funding-rate-history");
        assert_eq!(MockRest::param(&calls[0], "after").as_deref(), Some("9000"));
        assert_eq!(MockRest::param(&calls[1], "after").as_deref(), Some("8000"));
        assert_eq!(MockRest::param(&calls[0], "before").as_deref(), Some("6999"));
        assert_eq!(MockRest::param(&calls[0], "limit").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_positions_are_authenticated() {
        let rest = OkxRest::new(MockRest::with_responses(vec![
            ok(json!([{
                "instType": "SWAP",
                "instId": "ETH-USDT-SWAP",
                "pos": "2",
                "posSide": "net",
                "avgPx": "3400",
                "upl": "12.5"
            }])),
            ok(json!([])),
        ]));

        let positions = rest
            .get_positions(InstrumentType::Swap, Some("ETH-USDT-SWAP"))
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].upl, Decimal::new(125, 1));

        assert!(rest
            .get_positions(InstrumentType::Swap, None)
            .await
            .unwrap()
            .is_empty());

        let calls = rest.rest_client.calls.lock();
        assert!(calls[0].authenticated);
        assert_eq!(MockRest::param(&calls[0], "instId").as_deref(), Some("ETH-USDT-SWAP"));
        assert_eq!(MockRest::param(&calls[1], "instId"), None);
        assert_eq!(MockRest::param(&calls[1], "instType").as_deref(), Some("SWAP"));
    }
}
