//! Row types for the store's tables (§3 of the design doc).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pricing::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for MarketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "resolved" => Ok(MarketStatus::Resolved),
            other => Err(format!("invalid market status: '{other}'")),
        }
    }
}

/// Tagged scalar for resolution-criteria values (§9 "dynamic type leakage").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Scalar {
    String(String),
    Number(f64),
    Bool(bool),
}

impl Scalar {
    pub fn as_string_coercion(&self) -> String {
        match self {
            Scalar::String(s) => s.clone(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::String(s) => s.parse::<f64>().ok(),
            Scalar::Bool(_) => None,
        }
    }
}

/// The seven comparison operators named in §4.6/§4.8. Serialized as the
/// literal tokens the spec uses (`equals`, `>`, `>=`, ...) rather than a
/// derived variant name, since `>`/`<=` aren't valid Rust identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
}

impl ComparisonOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            ComparisonOperator::Equals => "equals",
            ComparisonOperator::NotEquals => "not_equals",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
            ComparisonOperator::Contains => "contains",
        }
    }
}

impl std::str::FromStr for ComparisonOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(ComparisonOperator::Equals),
            "not_equals" => Ok(ComparisonOperator::NotEquals),
            ">" => Ok(ComparisonOperator::GreaterThan),
            ">=" => Ok(ComparisonOperator::GreaterThanOrEqual),
            "<" => Ok(ComparisonOperator::LessThan),
            "<=" => Ok(ComparisonOperator::LessThanOrEqual),
            "contains" => Ok(ComparisonOperator::Contains),
            other => Err(format!("unknown comparison operator: '{other}'")),
        }
    }
}

impl Serialize for ComparisonOperator {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ComparisonOperator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Resolution criteria attached to a market at creation time: where to look
/// in the fetched payload, and how to turn the extracted scalar into YES/NO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionCriteria {
    pub path: String,
    pub operator: ComparisonOperator,
    pub value: Scalar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub title: String,
    pub category: Option<String>,
    pub source: String,
    pub resolution_criteria: Option<ResolutionCriteria>,
    pub creator: i64,
    pub q_yes: f64,
    pub q_no: f64,
    pub b: f64,
    pub status: MarketStatus,
    pub outcome: Option<Side>,
    pub closes_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Market {
    pub fn inventory(&self) -> crate::pricing::Inventory {
        crate::pricing::Inventory {
            q_yes: self.q_yes,
            q_no: self.q_no,
            b: self.b,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user: i64,
    pub market: i64,
    pub side: Side,
    pub shares: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Buy => "buy",
            TransactionType::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user: i64,
    pub market: i64,
    pub side: Side,
    pub transaction_type: TransactionType,
    pub shares: f64,
    pub price_per_share: f64,
    pub total_cash: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub market: i64,
    pub yes_price: f64,
    pub no_price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub market: i64,
    pub outcome: Side,
    pub source_url: String,
    pub source_response: serde_json::Value,
    pub calculation_steps: Vec<String>,
    pub final_value: Option<serde_json::Value>,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}
