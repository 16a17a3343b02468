//! EIP-712 typed structured data: schema validation and hashing.
//!
//! This module implements [EIP-712] for hashing typed structured data. The
//! Ledger app is driven in "hashed" mode: the host computes the domain
//! separator and the message struct hash, and the device signs
//!
//! ```text
//! keccak256("\x19\x01" || domainSeparator || hashStruct(message))
//! ```
//!
//! Because the device only ever sees the two hashes, the schema is checked
//! here before anything is sent: every type a field references must be
//! declared, and the primary type must resolve. [`TypedData::validate`]
//! reports violations as [`Error::SchemaError`].
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::{Eip712Domain, TypedData};
//! use serde_json::json;
//!
//! let domain = Eip712Domain {
//!     name: Some("My DApp".to_string()),
//!     version: Some("1".to_string()),
//!     ..Eip712Domain::default()
//! };
//!
//! let types = json!({
//!     "Person": [
//!         {"name": "name", "type": "string"},
//!         {"name": "wallet", "type": "address"}
//!     ]
//! });
//!
//! let message = json!({
//!     "name": "Alice",
//!     "wallet": "0x0000000000000000000000000000000000000001"
//! });
//!
//! let typed_data = TypedData::new(domain, types, "Person".to_string(), message).unwrap();
//! typed_data.validate().unwrap();
//! let hash = typed_data.signing_hash().unwrap();
//! ```
//!
//! [EIP-712]: https://eips.ethereum.org/EIPS/eip-712

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{B256, U256, keccak256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::{Error, Result};

/// Name of the domain type.
pub const DOMAIN_TYPE: &str = "EIP712Domain";

/// Domain members in their canonical order, with their types.
const DOMAIN_MEMBERS: [(&str, &str); 5] = [
    ("name", "string"),
    ("version", "string"),
    ("chainId", "uint256"),
    ("verifyingContract", "address"),
    ("salt", "bytes32"),
];

/// The EIP-712 domain separator parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Domain {
    /// The human-readable name of the signing domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The version of the signing domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The chain ID where signatures are valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<U256>,

    /// The address of the contract verifying the signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifying_contract: Option<Address>,

    /// A disambiguating salt for the protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<B256>,
}

impl Eip712Domain {
    /// Returns the `EIP712Domain` fields implied by the members that are set.
    #[must_use]
    pub fn implied_fields(&self) -> Vec<TypeField> {
        let present = [
            self.name.is_some(),
            self.version.is_some(),
            self.chain_id.is_some(),
            self.verifying_contract.is_some(),
            self.salt.is_some(),
        ];

        DOMAIN_MEMBERS
            .iter()
            .zip(present)
            .filter(|(_, is_set)| *is_set)
            .map(|((name, ty), _)| TypeField::new(name, ty))
            .collect()
    }
}

/// A type field definition for EIP-712.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeField {
    /// The name of the field.
    pub name: String,

    /// The type of the field (e.g., "string", "uint256", "Person[]").
    #[serde(rename = "type")]
    pub field_type: String,
}

impl TypeField {
    /// Creates a field.
    #[must_use]
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
        }
    }
}

/// Type definitions keyed by struct name.
pub type Types = BTreeMap<String, Vec<TypeField>>;

/// Typed structured data for EIP-712 signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    /// The EIP-712 domain.
    pub domain: Eip712Domain,

    /// The type definitions, optionally including `EIP712Domain`.
    pub types: Types,

    /// The primary type being signed.
    pub primary_type: String,

    /// The message data.
    pub message: Value,
}

impl TypedData {
    /// Creates a new typed data instance from a JSON `types` object.
    ///
    /// # Arguments
    ///
    /// * `domain` - The EIP-712 domain separator parameters
    /// * `types` - JSON object mapping type names to field lists
    /// * `primary_type` - The name of the primary type being signed
    /// * `message` - The message data as a JSON value
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if `types` is not an object of
    /// `{name, type}` lists.
    pub fn new(
        domain: Eip712Domain,
        types: Value,
        primary_type: String,
        message: Value,
    ) -> Result<Self> {
        let types: Types = serde_json::from_value(types)
            .map_err(|e| Error::SchemaError(format!("malformed types: {e}")))?;

        Ok(Self {
            domain,
            types,
            primary_type,
            message,
        })
    }

    /// Checks that the schema is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if:
    /// - the primary type is not declared
    /// - a field references a type that is neither declared nor atomic
    /// - a declared `EIP712Domain` has a member EIP-712 does not define
    pub fn validate(&self) -> Result<()> {
        if self.primary_type != DOMAIN_TYPE && !self.types.contains_key(&self.primary_type) {
            return Err(Error::SchemaError(format!(
                "primary type {:?} is not declared",
                self.primary_type
            )));
        }

        for (type_name, fields) in &self.types {
            if type_name.is_empty() {
                return Err(Error::SchemaError("empty type name".to_string()));
            }
            for field in fields {
                let base = base_type(&field.field_type);
                if !self.types.contains_key(base) && !is_atomic(base) {
                    return Err(Error::SchemaError(format!(
                        "{type_name}.{} references undeclared type {base:?}",
                        field.name
                    )));
                }
            }
        }

        if let Some(fields) = self.types.get(DOMAIN_TYPE) {
            for field in fields {
                if !DOMAIN_MEMBERS.iter().any(|(name, _)| *name == field.name) {
                    return Err(Error::SchemaError(format!(
                        "{DOMAIN_TYPE} has unknown member {:?}",
                        field.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns the domain separator.
    ///
    /// Uses the declared `EIP712Domain` type when present, otherwise the one
    /// implied by the domain members that are set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if the domain values do not fit the type.
    pub fn domain_hash(&self) -> Result<B256> {
        let types: Cow<'_, Types> = if self.types.contains_key(DOMAIN_TYPE) {
            Cow::Borrowed(&self.types)
        } else {
            let mut types = self.types.clone();
            types.insert(DOMAIN_TYPE.to_string(), self.domain.implied_fields());
            Cow::Owned(types)
        };

        let domain = serde_json::to_value(&self.domain)?;
        Encoder { types: &types }.hash_struct(DOMAIN_TYPE, &domain)
    }

    /// Returns `hashStruct(message)` for the primary type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] for undeclared types or values that do
    /// not match their declared type.
    pub fn message_hash(&self) -> Result<B256> {
        Encoder { types: &self.types }.hash_struct(&self.primary_type, &self.message)
    }

    /// Computes the final digest the device signs.
    ///
    /// # Errors
    ///
    /// See [`TypedData::domain_hash`] and [`TypedData::message_hash`].
    pub fn signing_hash(&self) -> Result<B256> {
        Ok(signing_hash(&self.domain_hash()?, &self.message_hash()?))
    }

    /// Returns the canonical type string of `type_name` with its dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if a referenced type is missing.
    pub fn encode_type(&self, type_name: &str) -> Result<String> {
        Encoder { types: &self.types }.encode_type(type_name)
    }

    /// Parses typed data from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the typed data to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Combines a domain separator and a struct hash into the signed digest.
#[must_use]
pub fn signing_hash(domain_hash: &B256, message_hash: &B256) -> B256 {
    let mut data = [0u8; 66];
    data[0] = 0x19;
    data[1] = 0x01;
    data[2..34].copy_from_slice(domain_hash.as_slice());
    data[34..].copy_from_slice(message_hash.as_slice());
    keccak256(data)
}

/// Hashes values against one set of type definitions.
struct Encoder<'a> {
    types: &'a Types,
}

impl Encoder<'_> {
    fn fields(&self, type_name: &str) -> Result<&[TypeField]> {
        self.types
            .get(type_name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::SchemaError(format!("type {type_name:?} is not declared")))
    }

    /// `hashStruct(s) = keccak256(typeHash || encodeData(s))`
    fn hash_struct(&self, type_name: &str, data: &Value) -> Result<B256> {
        let type_hash = keccak256(self.encode_type(type_name)?.as_bytes());

        let obj = data.as_object().ok_or_else(|| {
            Error::SchemaError(format!("value for {type_name} is not an object"))
        })?;

        let fields = self.fields(type_name)?;
        let mut buf = Vec::with_capacity(32 * (1 + fields.len()));
        buf.extend_from_slice(type_hash.as_slice());

        for field in fields {
            let value = obj.get(&field.name).ok_or_else(|| {
                Error::SchemaError(format!("{type_name} is missing field {:?}", field.name))
            })?;
            buf.extend_from_slice(self.encode_field(&field.field_type, value)?.as_slice());
        }

        Ok(keccak256(&buf))
    }

    /// `Primary(..)` followed by every transitively referenced struct, sorted.
    fn encode_type(&self, type_name: &str) -> Result<String> {
        let mut deps = BTreeSet::new();
        self.collect_dependencies(type_name, &mut deps)?;
        deps.remove(type_name);

        let mut result = self.type_signature(type_name)?;
        for dep in deps {
            result.push_str(&self.type_signature(dep)?);
        }
        Ok(result)
    }

    fn type_signature(&self, type_name: &str) -> Result<String> {
        let members: Vec<String> = self
            .fields(type_name)?
            .iter()
            .map(|f| format!("{} {}", f.field_type, f.name))
            .collect();
        Ok(format!("{type_name}({})", members.join(",")))
    }

    fn collect_dependencies<'t>(
        &'t self,
        type_name: &'t str,
        found: &mut BTreeSet<&'t str>,
    ) -> Result<()> {
        if !found.insert(type_name) {
            return Ok(());
        }
        for field in self.fields(type_name)? {
            let base = base_type(&field.field_type);
            if self.types.contains_key(base) {
                self.collect_dependencies(base, found)?;
            }
        }
        Ok(())
    }

    fn encode_field(&self, field_type: &str, value: &Value) -> Result<B256> {
        if let Some((element, len)) = split_array(field_type) {
            let items = value
                .as_array()
                .ok_or_else(|| Error::SchemaError(format!("expected array for {field_type}")))?;
            if let Some(len) = len
                && items.len() != len
            {
                return Err(Error::SchemaError(format!(
                    "{field_type} expects {len} items, got {}",
                    items.len()
                )));
            }

            let mut encoded = Vec::with_capacity(32 * items.len());
            for item in items {
                encoded.extend_from_slice(self.encode_field(element, item)?.as_slice());
            }
            return Ok(keccak256(&encoded));
        }

        if self.types.contains_key(field_type) {
            return self.hash_struct(field_type, value);
        }

        encode_atomic(field_type, value)
    }
}

/// Strips every array suffix: `Person[][3]` -> `Person`.
fn base_type(field_type: &str) -> &str {
    field_type.split('[').next().unwrap_or(field_type)
}

/// Splits off the outermost array dimension: `uint8[2][]` -> (`uint8[2]`, None).
fn split_array(field_type: &str) -> Option<(&str, Option<usize>)> {
    let inner = field_type.strip_suffix(']')?;
    let open = inner.rfind('[')?;
    let len = &inner[open + 1..];
    let len = if len.is_empty() {
        None
    } else {
        Some(len.parse().ok()?)
    };
    Some((&inner[..open], len))
}

fn is_atomic(ty: &str) -> bool {
    match ty {
        "string" | "bytes" | "bool" | "address" => true,
        _ => {
            if let Some(size) = ty.strip_prefix("bytes") {
                return size.parse::<usize>().is_ok_and(|n| (1..=32).contains(&n));
            }
            let bits = ty
                .strip_prefix("uint")
                .or_else(|| ty.strip_prefix("int"));
            bits.is_some_and(|b| {
                b.parse::<usize>()
                    .is_ok_and(|n| n % 8 == 0 && (8..=256).contains(&n))
            })
        }
    }
}

fn encode_atomic(field_type: &str, value: &Value) -> Result<B256> {
    let mut buf = [0u8; 32];

    match field_type {
        "string" => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::SchemaError("expected string".to_string()))?;
            Ok(keccak256(s.as_bytes()))
        }
        "bytes" => Ok(keccak256(parse_hex_bytes(value)?)),
        "bool" => {
            let b = value
                .as_bool()
                .ok_or_else(|| Error::SchemaError("expected bool".to_string()))?;
            buf[31] = u8::from(b);
            Ok(B256::from(buf))
        }
        "address" => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::SchemaError("expected address string".to_string()))?;
            let addr = Address::from_hex(s).map_err(|e| Error::SchemaError(e.to_string()))?;
            buf[12..].copy_from_slice(addr.as_bytes());
            Ok(B256::from(buf))
        }
        t if t.starts_with("bytes") => {
            let bytes = parse_hex_bytes(value)?;
            let size: usize = t[5..]
                .parse()
                .map_err(|_| Error::SchemaError(format!("invalid bytes type: {t}")))?;
            if bytes.len() > size {
                return Err(Error::SchemaError(format!(
                    "bytes too long for {t}: {} > {size}",
                    bytes.len()
                )));
            }
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(B256::from(buf))
        }
        t if t.starts_with("uint") => Ok(B256::from(parse_uint(value)?.to_be_bytes::<32>())),
        t if t.starts_with("int") => Ok(B256::from(parse_int(value)?.to_be_bytes::<32>())),
        _ => Err(Error::SchemaError(format!("unsupported type: {field_type}"))),
    }
}

fn parse_hex_bytes(value: &Value) -> Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::SchemaError("expected hex string".to_string()))?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| Error::SchemaError(format!("invalid hex: {e}")))
}

/// Parses a uint value from a JSON number, decimal string, or hex string.
fn parse_uint(value: &Value) -> Result<U256> {
    if let Some(n) = value.as_u64() {
        return Ok(U256::from(n));
    }
    if let Some(s) = value.as_str() {
        if let Some(hex_str) = s.strip_prefix("0x") {
            return U256::from_str_radix(hex_str, 16)
                .map_err(|_| Error::SchemaError(format!("invalid hex uint: {s}")));
        }
        return U256::from_str_radix(s, 10)
            .map_err(|_| Error::SchemaError(format!("invalid uint: {s}")));
    }
    Err(Error::SchemaError(format!("expected uint, got {value}")))
}

/// Parses an int value into its 256-bit two's complement.
fn parse_int(value: &Value) -> Result<U256> {
    let negative = value.as_i64().is_some_and(|n| n < 0)
        || value.as_str().is_some_and(|s| s.starts_with('-'));
    if !negative {
        return parse_uint(value);
    }

    let magnitude = match value {
        Value::Number(n) => n
            .as_i64()
            .map(|n| U256::from(n.unsigned_abs()))
            .ok_or_else(|| Error::SchemaError(format!("invalid int: {n}")))?,
        Value::String(s) => parse_uint(&Value::String(s[1..].to_string()))?,
        _ => return Err(Error::SchemaError(format!("expected int, got {value}"))),
    };
    Ok(U256::ZERO.wrapping_sub(magnitude))
}
