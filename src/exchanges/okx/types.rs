use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// OKX API standard response wrapper
#[derive(Debug, Deserialize, Serialize)]
pub struct OkxResponse<T> {
    pub code: String,
    pub msg: String,
    #[serde(default)]
    pub data: T,
}

/// One WebSocket stream: a channel on an instrument
///
/// Field order is fixed, so two equal subscriptions serialize to the same
/// bytes and [`Subscription::canonical`] can serve as the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, inst_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            inst_id: inst_id.into(),
        }
    }

    pub fn tickers(inst_id: impl Into<String>) -> Self {
        Self::new("tickers", inst_id)
    }

    pub fn candles(inst_id: impl Into<String>, bar: BarSize) -> Self {
        Self::new(bar.channel(), inst_id)
    }

    /// Compact JSON form, `{"channel":..,"instId":..}`
    pub fn canonical(&self) -> String {
        serde_json::json!({
            "channel": self.channel,
            "instId": self.inst_id,
        })
        .to_string()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
    Error,
}

/// Decoded control acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub event: EventKind,
    /// Present for subscribe/unsubscribe acks
    pub subscription: Option<Subscription>,
    /// Present for error acks
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Market data pushed on a subscribed channel, payload left undecoded
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub channel: String,
    pub inst_id: String,
    pub data: Value,
}

/// Candlestick period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BarSize {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    TwelveHours,
    OneDay,
    TwoDays,
    ThreeDays,
    OneWeek,
    OneMonth,
    ThreeMonths,
}

impl BarSize {
    pub const ALL: [Self; 16] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::SixHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::TwoDays,
        Self::ThreeDays,
        Self::OneWeek,
        Self::OneMonth,
        Self::ThreeMonths,
    ];

    /// Wire name, also the REST `bar` parameter
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1H",
            Self::TwoHours => "2H",
            Self::FourHours => "4H",
            Self::SixHours => "6H",
            Self::TwelveHours => "12H",
            Self::OneDay => "1D",
            Self::TwoDays => "2D",
            Self::ThreeDays => "3D",
            Self::OneWeek => "1W",
            Self::OneMonth => "1M",
            Self::ThreeMonths => "3M",
        }
    }

    /// WebSocket candle channel, e.g. `candle1H`
    pub fn channel(self) -> String {
        format!("candle{}", self.as_str())
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        channel
            .strip_prefix("candle")
            .and_then(|bar| bar.parse().ok())
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarSize {
    type Err = String;

    // Case matters: "1m" is a minute, "1M" a month
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|bar| bar.as_str() == s)
            .ok_or_else(|| format!("Unknown bar size: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Spot,
    Margin,
    Swap,
    Futures,
    Option,
}

impl InstrumentType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Margin => "MARGIN",
            Self::Swap => "SWAP",
            Self::Futures => "FUTURES",
            Self::Option => "OPTION",
        }
    }
}

/// OKX sends numbers as strings and uses "" for absent values
fn decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_decimal(&raw).map_err(serde::de::Error::custom)
}

fn millis_from_str<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_millis(&raw).map_err(serde::de::Error::custom)
}

fn int_or_zero<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<i32>().map_err(serde::de::Error::custom)
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| format!("Invalid decimal '{}': {}", raw, e))
}

fn parse_millis(raw: &str) -> Result<i64, String> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<i64>()
        .map_err(|e| format!("Invalid timestamp '{}': {}", raw, e))
}

/// OKX Ticker data
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub inst_type: String,
    pub inst_id: String,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub last: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub last_sz: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub ask_px: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub ask_sz: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub bid_px: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub bid_sz: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub open_24h: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub high_24h: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub low_24h: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub vol_ccy_24h: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub vol_24h: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub sod_utc0: Decimal,
    #[serde(deserialize_with = "decimal_or_zero")]
    pub sod_utc8: Decimal,
    #[serde(deserialize_with = "millis_from_str")]
    pub ts: i64,
}

/// One candlestick, decoded from the OKX row
/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(try_from = "Vec<String>")]
pub struct Candle {
    pub ts: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Volume in contracts (derivatives) or base currency (spot)
    pub vol: Decimal,
    pub vol_ccy: Decimal,
    pub vol_ccy_quote: Decimal,
    /// False while the period is still open
    pub confirm: bool,
}

impl TryFrom<Vec<String>> for Candle {
    type Error = String;

    fn try_from(row: Vec<String>) -> Result<Self, Self::Error> {
        if row.len() < 6 {
            return Err(format!(
                "Candle row needs at least 6 fields, got {}",
                row.len()
            ));
        }

        let field = |index: usize| row.get(index).map(String::as_str).unwrap_or("");

        Ok(Self {
            ts: parse_millis(field(0))?,
            open: parse_decimal(field(1))?,
            high: parse_decimal(field(2))?,
            low: parse_decimal(field(3))?,
            close: parse_decimal(field(4))?,
            vol: parse_decimal(field(5))?,
            vol_ccy: parse_decimal(field(6))?,
            vol_ccy_quote: parse_decimal(field(7))?,
            // Older rows have no confirm flag and are always closed
            confirm: field(8) != "0",
        })
    }
}

/// Decoded `tickers` channel payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TickerEvent {
    pub tickers: Vec<Ticker>,
}

/// Decoded `candle<bar>` channel payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct CandlestickEvent {
    pub candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
pub struct ServerTime {
    #[serde(deserialize_with = "millis_from_str")]
    pub ts: i64,
}

/// Per-currency account balance
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDetail {
    pub ccy: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub eq: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub cash_bal: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub avail_bal: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub avail_eq: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub frozen_bal: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub eq_usd: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub upl: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub liab: Decimal,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub u_time: i64,
}

/// Account-level balance summary
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub total_eq: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub adj_eq: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub iso_eq: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub imr: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub mmr: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub mgn_ratio: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub notional_usd: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub ord_froz: Decimal,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub u_time: i64,
    #[serde(default)]
    pub details: Vec<BalanceDetail>,
}

/// Tradable instrument from `/api/v5/public/instruments`.
///
/// Derivative-only fields are empty or zero on SPOT/MARGIN and vice versa.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub inst_type: InstrumentType,
    pub inst_id: String,
    #[serde(default)]
    pub inst_family: String,
    #[serde(default)]
    pub uly: String,
    #[serde(default)]
    pub base_ccy: String,
    #[serde(default)]
    pub quote_ccy: String,
    #[serde(default)]
    pub settle_ccy: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub ct_val: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub ct_mult: Decimal,
    #[serde(default)]
    pub ct_val_ccy: String,
    /// `C` or `P`, options only
    #[serde(default)]
    pub opt_type: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub stk: Decimal,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub list_time: i64,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub exp_time: i64,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub lever: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub tick_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub lot_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub min_sz: Decimal,
    /// `linear` or `inverse`
    #[serde(default)]
    pub ct_type: String,
    /// Futures alias such as `this_week`
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_lmt_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_mkt_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_twap_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_iceberg_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_trigger_sz: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_stop_sz: Decimal,
}

/// Funding rate of a perpetual swap, current or historical
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FundingRate {
    pub inst_type: InstrumentType,
    pub inst_id: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub funding_rate: Decimal,
    #[serde(deserialize_with = "millis_from_str")]
    pub funding_time: i64,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub next_funding_time: i64,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub next_funding_rate: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub interest_rate: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub premium: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub max_funding_rate: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub min_funding_rate: Decimal,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub ts: i64,
    /// `processing` or `settled`
    #[serde(default)]
    pub sett_state: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub sett_funding_rate: Decimal,
    /// Settled rate on history records
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub realized_rate: Decimal,
}

/// Open position from `/api/v5/account/positions`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default, deserialize_with = "int_or_zero")]
    pub adl: i32,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub avail_pos: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub avg_px: Decimal,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub c_time: i64,
    #[serde(default)]
    pub ccy: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub imr: Decimal,
    pub inst_id: String,
    pub inst_type: InstrumentType,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub interest: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub last: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub lever: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub liab: Decimal,
    #[serde(default)]
    pub liab_ccy: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub liq_px: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub margin: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub mark_px: Decimal,
    /// `cross` or `isolated`
    #[serde(default)]
    pub mgn_mode: String,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub mgn_ratio: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub mmr: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub notional_usd: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub pos: Decimal,
    #[serde(default)]
    pub pos_ccy: String,
    #[serde(default)]
    pub pos_id: String,
    /// `long`, `short` or `net`
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub trade_id: String,
    #[serde(default, deserialize_with = "millis_from_str")]
    pub u_time: i64,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub upl: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub upl_ratio: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_is_field_ordered_and_compact() {
        let sub = Subscription::tickers("ETH-USDT-SWAP");
        assert_eq!(
            sub.canonical(),
            r#"{"channel":"tickers","instId":"ETH-USDT-SWAP"}"#
        );
        assert_eq!(sub.canonical(), serde_json::to_string(&sub).unwrap());
        assert_eq!(
            sub.canonical(),
            Subscription::new("tickers", "ETH-USDT-SWAP").canonical()
        );
    }

    #[test]
    fn test_bar_size_channel_mapping() {
        for bar in BarSize::ALL {
            assert_eq!(BarSize::from_channel(&bar.channel()), Some(bar));
        }
        assert_eq!(BarSize::OneHour.channel(), "candle1H");
        assert_eq!(BarSize::from_channel("candle1M"), Some(BarSize::OneMonth));
        assert_eq!(BarSize::from_channel("candle1m"), Some(BarSize::OneMinute));
        assert_eq!(BarSize::from_channel("candle7m"), None);
        assert_eq!(BarSize::from_channel("tickers"), None);
    }

    #[test]
    fn test_ticker_reads_empty_strings_as_zero() {
        let ticker: Ticker = serde_json::from_value(json!({
            "instType": "SWAP",
            "instId": "ETH-USDT-SWAP",
            "last": "3412.5",
            "lastSz": "1",
            "askPx": "3412.6",
            "askSz": "120",
            "bidPx": "3412.5",
            "bidSz": "",
            "open24h": "3300",
            "high24h": "3450.1",
            "low24h": "3290",
            "volCcy24h": "51234.2",
            "vol24h": "5123420",
            "sodUtc0": "3350",
            "sodUtc8": "3320",
            "ts": "1700000000123"
        }))
        .unwrap();

        assert_eq!(ticker.last, Decimal::new(34125, 1));
        assert_eq!(ticker.bid_sz, Decimal::ZERO);
        assert_eq!(ticker.ts, 1_700_000_000_123);
    }

    #[test]
    fn test_candle_from_row() {
        let candles: CandlestickEvent = serde_json::from_value(json!([
            ["1700000000000", "10", "12", "9", "11", "100", "1000", "11000", "0"],
            ["1699999940000", "9", "10", "8", "10", "50", "500", "5000"]
        ]))
        .unwrap();

        assert_eq!(candles.candles.len(), 2);
        assert_eq!(candles.candles[0].close, Decimal::from(11));
        assert!(!candles.candles[0].confirm);
        assert!(candles.candles[1].confirm);
    }

    #[test]
    fn test_short_candle_row_is_rejected() {
        let result: Result<Candle, _> = serde_json::from_value(json!(["1", "2", "3"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_instrument_fills_missing_fields_with_zero() {
        let instrument: Instrument = serde_json::from_value(json!({
            "instType": "SWAP",
            "instId": "BTC-USDT-SWAP",
            "instFamily": "BTC-USDT",
            "uly": "BTC-USDT",
            "settleCcy": "USDT",
            "ctVal": "0.01",
            "ctType": "linear",
            "listTime": "1611916828000",
            "expTime": "",
            "lever": "100",
            "tickSz": "0.1",
            "lotSz": "1",
            "minSz": "1",
            "state": "live"
        }))
        .unwrap();

        assert_eq!(instrument.inst_type, InstrumentType::Swap);
        assert_eq!(instrument.ct_val, Decimal::new(1, 2));
        assert_eq!(instrument.exp_time, 0);
        assert_eq!(instrument.stk, Decimal::ZERO);
        assert!(instrument.base_ccy.is_empty());
    }

    #[test]
    fn test_position_reads_adl_and_side() {
        let position: Position = serde_json::from_value(json!({
            "adl": "3",
            "instId": "ETH-USDT-SWAP",
            "instType": "SWAP",
            "mgnMode": "cross",
            "pos": "-2",
            "posSide": "net",
            "avgPx": "3400.5",
            "liqPx": "",
            "uTime": "1700000000000"
        }))
        .unwrap();

        assert_eq!(position.adl, 3);
        assert_eq!(position.pos, Decimal::from(-2));
        assert_eq!(position.liq_px, Decimal::ZERO);
        assert_eq!(position.pos_side, "net");
    }
}
