// Normalization of raw upstream quotes into persisted records
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};

/// Normalize a raw quote into a validated [`PriceRecord`] captured at `now`
///
/// Checks run in order: empty quote, unparseable amount, non-positive value,
/// missing currency. Nothing downstream runs unless all of them pass.
pub fn normalize_quote(raw: &RawQuote, now: DateTime<Utc>) -> Result<PriceRecord> {
    if raw.is_empty() {
        return Err(ValidationError::MissingQuote.into());
    }

    let record = PriceRecord {
        value: parse_amount(raw.amount.as_ref())?,
        crypto_asset: raw.base.clone().unwrap_or_default(),
        quote_currency: raw.currency.clone().unwrap_or_default(),
        captured_at: format_timestamp(now),
    };

    validate_record(&record)?;
    Ok(record)
}

/// The data-quality gate applied to every record before it is loaded
pub fn validate_record(record: &PriceRecord) -> std::result::Result<(), ValidationError> {
    if record.value <= 0.0 {
        return Err(ValidationError::NonPositiveValue);
    }

    if record.quote_currency.trim().is_empty() {
        return Err(ValidationError::MissingCurrency);
    }

    Ok(())
}

/// RFC 3339 in UTC with a `Z` suffix; fractional seconds only when present
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_amount(amount: Option<&RawAmount>) -> std::result::Result<f64, ValidationError> {
    let value = match amount {
        None => return Err(ValidationError::InvalidAmount("missing amount".to_string())),
        Some(RawAmount::Number(v)) => *v,
        Some(RawAmount::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| ValidationError::InvalidAmount(format!("{:?}: {}", s, e)))?,
    };

    // "NaN" and "inf" parse fine but compare badly against zero
    if !value.is_finite() {
        return Err(ValidationError::InvalidAmount(format!("{} is not finite", value)));
    }

    Ok(value)
}
