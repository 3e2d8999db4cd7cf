// =============================================================================
// Shared types used across the candle engine
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Session type
// ---------------------------------------------------------------------------

/// Exchange sub-session a trade or candle belongs to.
///
/// Volume and price range of a candle never span two different session types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionType {
    #[default]
    Normal,
    /// Pre-open auction at the previous close.
    PreCloseBid,
    /// Pre-open execution at the previous close.
    PreClose,
    /// Pre-open auction.
    PreBid,
    /// Intraday auction (e.g. volatility interruption).
    TradingBid,
    /// Closing auction.
    MarketCloseBid,
    ExtendedCloseBid,
    ExtendedClose,
    ExtendedTradingBid,
    ExtendedTrading,
    Unknown,
}

impl SessionType {
    /// Short wire code shared by the store, the upstream and the tick feed.
    pub fn code(self) -> &'static str {
        match self {
            Self::Normal => "n",
            Self::PreCloseBid => "pcb",
            Self::PreClose => "pc",
            Self::PreBid => "pb",
            Self::TradingBid => "tb",
            Self::MarketCloseBid => "mcb",
            Self::ExtendedCloseBid => "ecb",
            Self::ExtendedClose => "ec",
            Self::ExtendedTradingBid => "etb",
            Self::ExtendedTrading => "et",
            Self::Unknown => "?",
        }
    }

    /// Decode a wire code. Unrecognised codes map to [`SessionType::Unknown`].
    pub fn from_code(code: &str) -> Self {
        match code {
            "n" => Self::Normal,
            "pcb" => Self::PreCloseBid,
            "pc" => Self::PreClose,
            "pb" => Self::PreBid,
            "tb" => Self::TradingBid,
            "mcb" => Self::MarketCloseBid,
            "ecb" => Self::ExtendedCloseBid,
            "ec" => Self::ExtendedClose,
            "etb" => Self::ExtendedTradingBid,
            "et" => Self::ExtendedTrading,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for SessionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for SessionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_code(&code))
    }
}

// ---------------------------------------------------------------------------
// Interval kind (base granularity)
// ---------------------------------------------------------------------------

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Base granularity of a unit candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntervalKind {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl IntervalKind {
    pub const ALL: [IntervalKind; 5] = [
        IntervalKind::Minute,
        IntervalKind::Hour,
        IntervalKind::Day,
        IntervalKind::Week,
        IntervalKind::Month,
    ];

    pub fn as_char(self) -> char {
        match self {
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'M',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'm' => Some(Self::Minute),
            'h' => Some(Self::Hour),
            'd' => Some(Self::Day),
            'w' => Some(Self::Week),
            'M' => Some(Self::Month),
            _ => None,
        }
    }

    /// Nominal length of one unit in milliseconds. Months count as 30 days;
    /// calendar-exact boundaries come from [`crate::market_data::SessionCalendar`].
    pub fn unit_ms(self) -> i64 {
        match self {
            Self::Minute => MINUTE_MS,
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
            Self::Week => 7 * DAY_MS,
            Self::Month => 30 * DAY_MS,
        }
    }

    /// Intraday kinds keep extended-session trades and align grouped buckets
    /// to wall-clock boundaries.
    pub fn is_intraday(self) -> bool {
        matches!(self, Self::Minute | Self::Hour)
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl Serialize for IntervalKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IntervalKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown interval kind {s}"))),
            _ => Err(serde::de::Error::custom(format!("unknown interval kind {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interval spec
// ---------------------------------------------------------------------------

/// `<multiple><kind>`, e.g. `15m`, `4h`, `1M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalSpec {
    pub multiple: u32,
    pub kind: IntervalKind,
}

impl IntervalSpec {
    pub fn new(multiple: u32, kind: IntervalKind) -> Self {
        Self { multiple, kind }
    }

    /// Parse a spec string, returning `None` for anything unparsable.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let last = s.chars().last()?;
        let kind = IntervalKind::from_char(last)?;
        let digits = &s[..s.len() - last.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let multiple = digits.parse::<u32>().ok()?;
        Some(Self { multiple, kind })
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.multiple, self.kind)
    }
}

impl FromStr for IntervalSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| anyhow::anyhow!("invalid interval spec: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_codes_roundtrip() {
        for st in [
            SessionType::Normal,
            SessionType::PreCloseBid,
            SessionType::PreClose,
            SessionType::PreBid,
            SessionType::TradingBid,
            SessionType::MarketCloseBid,
            SessionType::ExtendedCloseBid,
            SessionType::ExtendedClose,
            SessionType::ExtendedTradingBid,
            SessionType::ExtendedTrading,
        ] {
            assert_eq!(SessionType::from_code(st.code()), st);
        }
        assert_eq!(SessionType::from_code("zz"), SessionType::Unknown);
    }

    #[test]
    fn session_serde_uses_codes() {
        let json = serde_json::to_string(&SessionType::PreBid).unwrap();
        assert_eq!(json, "\"pb\"");
        let st: SessionType = serde_json::from_str("\"et\"").unwrap();
        assert_eq!(st, SessionType::ExtendedTrading);
    }

    #[test]
    fn parse_interval_specs() {
        assert_eq!(
            IntervalSpec::parse("15m"),
            Some(IntervalSpec::new(15, IntervalKind::Minute))
        );
        assert_eq!(
            IntervalSpec::parse("1M"),
            Some(IntervalSpec::new(1, IntervalKind::Month))
        );
        assert_eq!(
            IntervalSpec::parse("4h"),
            Some(IntervalSpec::new(4, IntervalKind::Hour))
        );
        assert_eq!(IntervalSpec::parse("m"), None);
        assert_eq!(IntervalSpec::parse("5x"), None);
        assert_eq!(IntervalSpec::parse("-1d"), None);
        assert_eq!(IntervalSpec::parse(""), None);
        assert_eq!(IntervalSpec::new(3, IntervalKind::Week).to_string(), "3w");
    }

    #[test]
    fn intraday_kinds() {
        assert!(IntervalKind::Minute.is_intraday());
        assert!(IntervalKind::Hour.is_intraday());
        assert!(!IntervalKind::Day.is_intraday());
        assert!(!IntervalKind::Month.is_intraday());
    }
}
