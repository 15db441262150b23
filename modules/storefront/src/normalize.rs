//! Product record normalization
//!
//! Upstream catalog exports do not agree on field names (`name` vs `nameEn`
//! vs `name_en`, `price` in major units vs `price_minor`, camelCase flags).
//! This is the only place those shapes are understood; the rest of the
//! service works with [`Product`].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

use crate::models::Product;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no id")]
    MissingId,

    #[error("record {0} has no name")]
    MissingName(String),

    #[error("record {0} has no price")]
    MissingPrice(String),

    #[error("record {id} has an invalid price: {raw}")]
    InvalidPrice { id: String, raw: String },
}

const ID_KEYS: &[&str] = &["id", "product_id", "productId"];
const NAME_EN_KEYS: &[&str] = &["name_en", "nameEn", "name", "title"];
const NAME_AR_KEYS: &[&str] = &["name_ar", "nameAr"];
const CATEGORY_KEYS: &[&str] = &["category_id", "categoryId"];
const IMAGE_KEYS: &[&str] = &["image_url", "imageUrl", "image"];
const ACTIVE_KEYS: &[&str] = &["is_active", "isActive", "active"];

/// Normalize one upstream product record into the canonical [`Product`].
pub fn normalize_product(record: &Value) -> Result<Product, NormalizeError> {
    let object = record.as_object().ok_or(NormalizeError::NotAnObject)?;
    let field = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| object.get(*k))
            .find(|v| !v.is_null())
    };

    let id = field(ID_KEYS)
        .and_then(scalar_text)
        .ok_or(NormalizeError::MissingId)?;

    let name_en = field(NAME_EN_KEYS)
        .and_then(scalar_text)
        .ok_or_else(|| NormalizeError::MissingName(id.clone()))?;

    let name_ar = field(NAME_AR_KEYS)
        .and_then(scalar_text)
        .unwrap_or_else(|| name_en.clone());

    let price_minor = match object.get("price_minor").filter(|v| !v.is_null()) {
        Some(minor) => minor
            .as_i64()
            .filter(|v| (0..=Product::MAX_PRICE_MINOR).contains(v))
            .ok_or_else(|| NormalizeError::InvalidPrice {
                id: id.clone(),
                raw: minor.to_string(),
            })?,
        None => {
            let price = object
                .get("price")
                .filter(|v| !v.is_null())
                .ok_or_else(|| NormalizeError::MissingPrice(id.clone()))?;
            major_to_minor(price).ok_or_else(|| NormalizeError::InvalidPrice {
                id: id.clone(),
                raw: price.to_string(),
            })?
        }
    };

    let is_active = field(ACTIVE_KEYS).map(truthy).unwrap_or(true);

    Ok(Product {
        id,
        name_en,
        name_ar,
        price_minor,
        category_id: field(CATEGORY_KEYS).and_then(scalar_text),
        image_url: field(IMAGE_KEYS).and_then(scalar_text),
        is_active,
    })
}

/// Convert a major-unit price (number or numeric string) to minor units.
/// Negative prices and prices above [`Product::MAX_PRICE_MINOR`] yield `None`.
pub fn major_to_minor(price: &Value) -> Option<i64> {
    let text = match price {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    let major = Decimal::from_str(&text).ok()?;
    if major.is_sign_negative() {
        return None;
    }
    major
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|minor| *minor <= Product::MAX_PRICE_MINOR)
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(true),
        Value::String(s) => !matches!(s.trim().to_lowercase().as_str(), "false" | "0" | "no"),
        _ => true,
    }
}
