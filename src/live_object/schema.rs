//! Property schema: the static description of a live object's fields.
//!
//! Entity definitions are built once at startup with [`EntityDefinition::builder`]
//! and validated eagerly; everything downstream treats them as immutable data.

use std::collections::HashSet;
use std::str::FromStr;

use alloy_primitives::{Address, B256, I256, U256};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::db::{ColumnType, DbValue};

use super::error::{CoercionError, ConfigError};
use super::event::{format_address, ChainId};

/// Semantic type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    /// 64-bit signed integer
    Number,
    Float,
    /// Arbitrary precision integer (up to 256 bits), stored as text
    BigInt,
    /// Arbitrary precision decimal, stored as text
    BigFloat,
    Boolean,
    Timestamp,
    Address,
    Hash,
    BlockNumber,
    ChainId,
    Json,
}

impl PropertyType {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::String => "String",
            PropertyType::Number => "Number",
            PropertyType::Float => "Float",
            PropertyType::BigInt => "BigInt",
            PropertyType::BigFloat => "BigFloat",
            PropertyType::Boolean => "Boolean",
            PropertyType::Timestamp => "Timestamp",
            PropertyType::Address => "Address",
            PropertyType::Hash => "Hash",
            PropertyType::BlockNumber => "BlockNumber",
            PropertyType::ChainId => "ChainId",
            PropertyType::Json => "Json",
        }
    }

    /// The storage column each semantic type maps to unless overridden.
    pub fn default_column_type(&self) -> ColumnType {
        match self {
            PropertyType::String => ColumnType::Varchar,
            PropertyType::Number => ColumnType::BigInt,
            PropertyType::Float => ColumnType::DoublePrecision,
            PropertyType::BigInt | PropertyType::BigFloat => ColumnType::Varchar,
            PropertyType::Boolean => ColumnType::Boolean,
            PropertyType::Timestamp => ColumnType::TimestampTz,
            PropertyType::Address => ColumnType::VarcharN(50),
            PropertyType::Hash => ColumnType::VarcharN(70),
            PropertyType::BlockNumber => ColumnType::BigInt,
            PropertyType::ChainId => ColumnType::Varchar,
            PropertyType::Json => ColumnType::Json,
        }
    }

    /// Convert a handler-provided value into a typed storage value.
    pub fn coerce(&self, property: &str, value: &Value) -> Result<DbValue, CoercionError> {
        let fail = |reason: String| CoercionError {
            property: property.to_string(),
            expected: self.name(),
            value: truncate(value.to_string()),
            reason,
        };

        if value.is_null() {
            return Ok(DbValue::Null);
        }

        match self {
            PropertyType::String => match value {
                Value::String(s) => Ok(DbValue::Text(s.clone())),
                Value::Number(n) => Ok(DbValue::Text(n.to_string())),
                _ => Err(fail("expected a string".to_string())),
            },
            PropertyType::Number => as_i64(value)
                .map(DbValue::Int64)
                .ok_or_else(|| fail("expected a 64-bit integer".to_string())),
            PropertyType::BlockNumber => match as_i64(value) {
                Some(n) if n >= 0 => Ok(DbValue::Int64(n)),
                _ => Err(fail("expected a non-negative block number".to_string())),
            },
            PropertyType::Float => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(DbValue::Float64)
                    .ok_or_else(|| fail("not representable as f64".to_string())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(DbValue::Float64)
                    .map_err(|e| fail(e.to_string())),
                _ => Err(fail("expected a number".to_string())),
            },
            PropertyType::BigInt => {
                let raw = number_or_string(value).ok_or_else(|| fail("expected an integer".to_string()))?;
                parse_big_int(&raw).map(DbValue::Numeric).map_err(fail)
            }
            PropertyType::BigFloat => {
                let raw = number_or_string(value).ok_or_else(|| fail("expected a decimal".to_string()))?;
                parse_big_float(&raw).map(DbValue::Numeric).map_err(fail)
            }
            PropertyType::Boolean => match value {
                Value::Bool(b) => Ok(DbValue::Bool(*b)),
                Value::String(s) if s == "true" => Ok(DbValue::Bool(true)),
                Value::String(s) if s == "false" => Ok(DbValue::Bool(false)),
                _ => Err(fail("expected a boolean".to_string())),
            },
            PropertyType::Timestamp => parse_timestamp(value).map(DbValue::Timestamp).map_err(fail),
            PropertyType::Address => match value {
                Value::String(s) => s
                    .trim()
                    .parse::<Address>()
                    .map(|a| DbValue::Text(format_address(&a)))
                    .map_err(|e| fail(e.to_string())),
                _ => Err(fail("expected a hex address string".to_string())),
            },
            PropertyType::Hash => match value {
                Value::String(s) => s
                    .trim()
                    .parse::<B256>()
                    .map(|h| DbValue::Text(format!("0x{}", hex::encode(h.as_slice()))))
                    .map_err(|e| fail(e.to_string())),
                _ => Err(fail("expected a 32-byte hex string".to_string())),
            },
            PropertyType::ChainId => number_or_string(value)
                .map(DbValue::Text)
                .ok_or_else(|| fail("expected a chain id".to_string())),
            PropertyType::Json => Ok(DbValue::Json(value.clone())),
        }
    }
}

fn truncate(mut s: String) -> String {
    const MAX: usize = 80;
    if s.len() > MAX {
        let mut cut = MAX;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn number_or_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Validate a 256-bit integer (decimal or 0x hex) and normalize it to decimal.
fn parse_big_int(raw: &str) -> Result<String, String> {
    if let Some(rest) = raw.strip_prefix('-') {
        let magnitude = U256::from_str(rest).map_err(|e| e.to_string())?;
        let value = I256::checked_from_sign_and_abs(alloy_primitives::Sign::Negative, magnitude)
            .ok_or_else(|| "out of int256 range".to_string())?;
        return Ok(value.to_string());
    }
    U256::from_str(raw)
        .map(|v| v.to_string())
        .map_err(|e| e.to_string())
}

fn parse_big_float(raw: &str) -> Result<String, String> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next();

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let valid = match frac {
        Some(f) => all_digits(whole) && all_digits(f),
        None => all_digits(whole),
    };
    if valid {
        Ok(raw.to_string())
    } else {
        Err("not a plain decimal number".to_string())
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| "expected integer unix seconds".to_string())?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("{} is out of range", secs))
        }
        Value::String(s) => {
            if let Ok(secs) = s.trim().parse::<i64>() {
                return parse_timestamp(&Value::from(secs));
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| e.to_string())
        }
        _ => Err("expected unix seconds or an RFC 3339 string".to_string()),
    }
}

/// The four fields every live object carries, hydrated from the event origin
/// and overwritten on every handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseProperty {
    ChainId,
    BlockNumber,
    BlockTimestamp,
    BlockHash,
}

impl BaseProperty {
    pub const ALL: [BaseProperty; 4] = [
        BaseProperty::ChainId,
        BaseProperty::BlockNumber,
        BaseProperty::BlockTimestamp,
        BaseProperty::BlockHash,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BaseProperty::ChainId => "chainId",
            BaseProperty::BlockNumber => "blockNumber",
            BaseProperty::BlockTimestamp => "blockTimestamp",
            BaseProperty::BlockHash => "blockHash",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            BaseProperty::ChainId => "chain_id",
            BaseProperty::BlockNumber => "block_number",
            BaseProperty::BlockTimestamp => "block_timestamp",
            BaseProperty::BlockHash => "block_hash",
        }
    }

    pub fn property_type(&self) -> PropertyType {
        match self {
            BaseProperty::ChainId => PropertyType::ChainId,
            BaseProperty::BlockNumber => PropertyType::BlockNumber,
            BaseProperty::BlockTimestamp => PropertyType::Timestamp,
            BaseProperty::BlockHash => PropertyType::Hash,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// One declared property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub property_type: PropertyType,
    pub default: Option<Value>,
    pub can_update: bool,
    pub column_type: Option<ColumnType>,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            default: None,
            can_update: true,
            column_type: None,
        }
    }

    /// Value written on insert when the handler leaves the property unset.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// `false` makes the first persisted value permanent.
    pub fn can_update(mut self, can_update: bool) -> Self {
        self.can_update = can_update;
        self
    }

    pub fn column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = Some(column_type);
        self
    }

    pub fn column(&self) -> String {
        to_snake_case(&self.name)
    }

    pub fn resolved_column_type(&self) -> ColumnType {
        self.column_type
            .unwrap_or_else(|| self.property_type.default_column_type())
    }
}

/// A uniqueBy entry: either a declared property or a base property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProperty {
    Declared(usize),
    Base(BaseProperty),
}

/// A named record type with its schema, uniqueness constraint and chain set.
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    name: String,
    table: String,
    properties: Vec<PropertyDef>,
    unique_by: Vec<String>,
    unique_key: Vec<KeyProperty>,
    chains: HashSet<ChainId>,
}

impl EntityDefinition {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityDefinitionBuilder {
        EntityDefinitionBuilder {
            name: name.into(),
            table: table.into(),
            properties: Vec::new(),
            unique_by: Vec::new(),
            chains: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn unique_by(&self) -> &[String] {
        &self.unique_by
    }

    pub fn unique_key(&self) -> &[KeyProperty] {
        &self.unique_key
    }

    pub fn chains(&self) -> &HashSet<ChainId> {
        &self.chains
    }

    /// An empty chain set means every chain.
    pub fn supports_chain(&self, chain_id: &str) -> bool {
        self.chains.is_empty() || self.chains.contains(chain_id)
    }

    /// Replace the chain set (configuration override).
    pub fn with_chains<I, S>(mut self, chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChainId>,
    {
        self.chains = chains.into_iter().map(Into::into).collect();
        self
    }
}

pub struct EntityDefinitionBuilder {
    name: String,
    table: String,
    properties: Vec<PropertyDef>,
    unique_by: Vec<String>,
    chains: HashSet<ChainId>,
}

impl EntityDefinitionBuilder {
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn unique_by<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_by = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn chains<I, S>(mut self, chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChainId>,
    {
        self.chains = chains.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<EntityDefinition, ConfigError> {
        let entity = self.name.clone();
        let invalid = |reason: String| ConfigError::InvalidEntity {
            entity: entity.clone(),
            reason,
        };

        if self.table.trim().is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for property in &self.properties {
            if BaseProperty::from_name(&property.name).is_some() {
                return Err(invalid(format!(
                    "property '{}' shadows a base property",
                    property.name
                )));
            }
            if !seen.insert(property.name.as_str()) {
                return Err(invalid(format!("property '{}' declared twice", property.name)));
            }
            if let Some(default) = &property.default {
                property
                    .property_type
                    .coerce(&property.name, default)
                    .map_err(|source| ConfigError::InvalidDefault {
                        entity: entity.clone(),
                        property: property.name.clone(),
                        source,
                    })?;
            }
        }

        if self.unique_by.is_empty() {
            return Err(invalid("uniqueBy must name at least one property".to_string()));
        }

        let mut unique_key = Vec::with_capacity(self.unique_by.len());
        let mut seen_keys = HashSet::new();
        for name in &self.unique_by {
            if !seen_keys.insert(name.as_str()) {
                return Err(invalid(format!("uniqueBy lists '{}' twice", name)));
            }
            let key = if let Some(base) = BaseProperty::from_name(name) {
                KeyProperty::Base(base)
            } else if let Some(idx) = self.properties.iter().position(|p| &p.name == name) {
                KeyProperty::Declared(idx)
            } else {
                return Err(ConfigError::UndeclaredUniqueBy {
                    entity: entity.clone(),
                    property: name.clone(),
                });
            };
            unique_key.push(key);
        }

        Ok(EntityDefinition {
            name: self.name,
            table: self.table,
            properties: self.properties,
            unique_by: self.unique_by,
            unique_key,
            chains: self.chains,
        })
    }
}

/// `projectId` -> `project_id`, `tokenURI` -> `token_uri`.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map(|n| n.is_ascii_lowercase()).unwrap_or(false);
            let prev_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            if i > 0 && (prev_lower || (prev_upper && next_lower)) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}
