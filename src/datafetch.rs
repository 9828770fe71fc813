//! Data-fetch capability (C6): retrieve an external payload, extract a
//! scalar from it by dotted path, and evaluate it against a criterion.
//! The resolver depends only on the `DataFetcher` trait; tests substitute
//! [`StubDataFetcher`] rather than making real HTTP calls.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::{ComparisonOperator, Scalar};

#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> AppResult<Value>;
}

/// Production fetcher: plain JSON GET with a 10-second deadline, grounded
/// in the oracle client's `reqwest::Client` usage.
pub struct HttpDataFetcher {
    client: Client,
}

impl HttpDataFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl DataFetcher for HttpDataFetcher {
    async fn fetch(&self, source: &str) -> AppResult<Value> {
        let response = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|e| AppError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::FetchFailed(format!(
                "status {}",
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::FetchFailed(e.to_string()))
    }
}

/// Fixed-response fetcher for tests: always returns (or fails with) the
/// canned payload it was built with.
pub struct StubDataFetcher {
    result: AppResult<Value>,
}

impl StubDataFetcher {
    pub fn ok(payload: Value) -> Self {
        Self { result: Ok(payload) }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Err(AppError::FetchFailed(message.into())),
        }
    }
}

#[async_trait]
impl DataFetcher for StubDataFetcher {
    async fn fetch(&self, _source: &str) -> AppResult<Value> {
        match &self.result {
            Ok(v) => Ok(v.clone()),
            Err(AppError::FetchFailed(m)) => Err(AppError::FetchFailed(m.clone())),
            Err(_) => Err(AppError::FetchFailed("stub error".to_string())),
        }
    }
}

/// Dotted-path extraction with array index syntax (`field[n]`). Any missing
/// or null link along the path yields `PathMissing`, never a panic.
pub fn extract(payload: &Value, path: &str) -> AppResult<Scalar> {
    let mut current = payload;
    for segment in path.split('.') {
        let (field, index) = split_index(segment);
        current = current
            .get(field)
            .ok_or_else(|| AppError::PathMissing(path.to_string()))?;
        if let Some(i) = index {
            current = current
                .get(i)
                .ok_or_else(|| AppError::PathMissing(path.to_string()))?;
        }
        if current.is_null() {
            return Err(AppError::PathMissing(path.to_string()));
        }
    }
    value_to_scalar(current).ok_or_else(|| AppError::PathMissing(path.to_string()))
}

fn split_index(segment: &str) -> (&str, Option<usize>) {
    if let Some(open) = segment.find('[') {
        if let Some(close) = segment.find(']') {
            if close > open {
                let field = &segment[..open];
                let idx = segment[open + 1..close].parse::<usize>().ok();
                return (field, idx);
            }
        }
    }
    (segment, None)
}

fn value_to_scalar(v: &Value) -> Option<Scalar> {
    match v {
        Value::String(s) => Some(Scalar::String(s.clone())),
        Value::Number(n) => n.as_f64().map(Scalar::Number),
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        _ => None,
    }
}

/// Evaluate `actual <operator> expected`. Numeric comparisons coerce both
/// sides via decimal parsing; `equals`/`not_equals` compare the string
/// coercion; `contains` is a case-insensitive substring check.
pub fn evaluate(actual: &Scalar, operator: ComparisonOperator, expected: &Scalar) -> AppResult<bool> {
    use ComparisonOperator::*;
    match operator {
        Equals => Ok(actual.as_string_coercion() == expected.as_string_coercion()),
        NotEquals => Ok(actual.as_string_coercion() != expected.as_string_coercion()),
        GreaterThan | GreaterThanOrEqual | LessThan | LessThanOrEqual => {
            let a = actual
                .as_number()
                .ok_or_else(|| AppError::UnknownOperator(format!("non-numeric operand for {operator:?}")))?;
            let e = expected
                .as_number()
                .ok_or_else(|| AppError::UnknownOperator(format!("non-numeric operand for {operator:?}")))?;
            Ok(match operator {
                GreaterThan => a > e,
                GreaterThanOrEqual => a >= e,
                LessThan => a < e,
                LessThanOrEqual => a <= e,
                _ => unreachable!(),
            })
        }
        Contains => {
            let a = actual.as_string_coercion().to_lowercase();
            let e = expected.as_string_coercion().to_lowercase();
            Ok(a.contains(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_array_field() {
        let payload = json!({ "result": { "items": [{ "value": 42 }] } });
        let scalar = extract(&payload, "result.items[0].value").unwrap();
        assert_eq!(scalar, Scalar::Number(42.0));
    }

    #[test]
    fn missing_path_is_path_missing() {
        let payload = json!({ "result": {} });
        let err = extract(&payload, "result.missing.field").unwrap_err();
        assert!(matches!(err, AppError::PathMissing(_)));
    }

    #[test]
    fn contains_is_case_insensitive() {
        let actual = Scalar::String("Resolved YES".to_string());
        let expected = Scalar::String("yes".to_string());
        assert!(evaluate(&actual, ComparisonOperator::Contains, &expected).unwrap());
    }

    #[test]
    fn numeric_threshold_comparison() {
        let actual = Scalar::Number(101.5);
        let expected = Scalar::Number(100.0);
        assert!(evaluate(&actual, ComparisonOperator::GreaterThan, &expected).unwrap());
    }
}
