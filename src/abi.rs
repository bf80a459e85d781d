/// ABI types, values and their canonical encoding/decoding
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{be_to_u256, selector_of, u256_to_be, EVMAddress, EVMU256};
use revm::primitives::B160;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("unknown ABI type: {0}")]
    UnknownType(String),
    #[error("malformed ABI json: {0}")]
    MalformedJson(String),
    #[error("calldata too short or malformed at offset {0}")]
    Decode(usize),
}

/// Closed set of ABI parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbiType {
    Uint(usize),
    Int(usize),
    Address,
    Bool,
    FixedBytes(usize),
    Bytes,
    String,
    /// dynamically sized `T[]`
    Array(Box<AbiType>),
    /// statically sized `T[n]`
    FixedArray(Box<AbiType>, usize),
    Tuple(Vec<AbiType>),
}

impl AbiType {
    /// Parse a canonical solidity type string, e.g. `uint256`, `bytes32[4]`,
    /// `(address,uint256)[]`.
    pub fn parse(s: &str) -> Result<Self, AbiError> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(AbiType::Array(Box::new(Self::parse(inner)?)));
        }
        if s.ends_with(']') {
            let open = s
                .rfind('[')
                .ok_or_else(|| AbiError::UnknownType(s.to_string()))?;
            let n: usize = s[open + 1..s.len() - 1]
                .parse()
                .map_err(|_| AbiError::UnknownType(s.to_string()))?;
            return Ok(AbiType::FixedArray(Box::new(Self::parse(&s[..open])?), n));
        }
        if s.starts_with('(') && s.ends_with(')') {
            let inner = &s[1..s.len() - 1];
            let mut parts = vec![];
            let mut depth = 0usize;
            let mut last = 0usize;
            for (i, c) in inner.char_indices() {
                match c {
                    '(' | '[' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    ',' if depth == 0 => {
                        parts.push(Self::parse(&inner[last..i])?);
                        last = i + 1;
                    }
                    _ => {}
                }
            }
            if !inner.is_empty() {
                parts.push(Self::parse(&inner[last..])?);
            }
            return Ok(AbiType::Tuple(parts));
        }
        match s {
            "address" => Ok(AbiType::Address),
            "bool" => Ok(AbiType::Bool),
            "bytes" => Ok(AbiType::Bytes),
            "string" => Ok(AbiType::String),
            "uint" => Ok(AbiType::Uint(256)),
            "int" => Ok(AbiType::Int(256)),
            _ => {
                if let Some(bits) = s.strip_prefix("uint") {
                    let bits: usize = bits.parse().map_err(|_| AbiError::UnknownType(s.into()))?;
                    if bits == 0 || bits > 256 || bits % 8 != 0 {
                        return Err(AbiError::UnknownType(s.into()));
                    }
                    Ok(AbiType::Uint(bits))
                } else if let Some(bits) = s.strip_prefix("int") {
                    let bits: usize = bits.parse().map_err(|_| AbiError::UnknownType(s.into()))?;
                    if bits == 0 || bits > 256 || bits % 8 != 0 {
                        return Err(AbiError::UnknownType(s.into()));
                    }
                    Ok(AbiType::Int(bits))
                } else if let Some(n) = s.strip_prefix("bytes") {
                    let n: usize = n.parse().map_err(|_| AbiError::UnknownType(s.into()))?;
                    if n == 0 || n > 32 {
                        return Err(AbiError::UnknownType(s.into()));
                    }
                    Ok(AbiType::FixedBytes(n))
                } else {
                    Err(AbiError::UnknownType(s.into()))
                }
            }
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            AbiType::Uint(bits) => format!("uint{}", bits),
            AbiType::Int(bits) => format!("int{}", bits),
            AbiType::Address => "address".into(),
            AbiType::Bool => "bool".into(),
            AbiType::FixedBytes(n) => format!("bytes{}", n),
            AbiType::Bytes => "bytes".into(),
            AbiType::String => "string".into(),
            AbiType::Array(inner) => format!("{}[]", inner.canonical()),
            AbiType::FixedArray(inner, n) => format!("{}[{}]", inner.canonical(), n),
            AbiType::Tuple(parts) => {
                let inner: Vec<String> = parts.iter().map(|p| p.canonical()).collect();
                format!("({})", inner.join(","))
            }
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            AbiType::Bytes | AbiType::String | AbiType::Array(_) => true,
            AbiType::FixedArray(inner, _) => inner.is_dynamic(),
            AbiType::Tuple(parts) => parts.iter().any(|p| p.is_dynamic()),
            _ => false,
        }
    }

    /// Size of this type in the head section of the encoding.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return 32;
        }
        match self {
            AbiType::FixedArray(inner, n) => inner.head_size() * n,
            AbiType::Tuple(parts) => parts.iter().map(|p| p.head_size()).sum(),
            _ => 32,
        }
    }

    /// All-zero value of this type, used as the shrinker's canonical form.
    pub fn default_value(&self) -> AbiValue {
        match self {
            AbiType::Uint(bits) => AbiValue::Uint(EVMU256::ZERO, *bits),
            AbiType::Int(bits) => AbiValue::Int(EVMU256::ZERO, *bits),
            AbiType::Address => AbiValue::Address(B160::zero()),
            AbiType::Bool => AbiValue::Bool(false),
            AbiType::FixedBytes(n) => AbiValue::FixedBytes(vec![0u8; *n]),
            AbiType::Bytes => AbiValue::Bytes(vec![]),
            AbiType::String => AbiValue::Str(String::new()),
            AbiType::Array(inner) => AbiValue::Array(*inner.clone(), vec![]),
            AbiType::FixedArray(inner, n) => {
                AbiValue::FixedArray((0..*n).map(|_| inner.default_value()).collect())
            }
            AbiType::Tuple(parts) => {
                AbiValue::Tuple(parts.iter().map(|p| p.default_value()).collect())
            }
        }
    }
}

/// A concrete ABI value. Integers are stored as their 256-bit two's
/// complement word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbiValue {
    Uint(EVMU256, usize),
    Int(EVMU256, usize),
    Address(EVMAddress),
    Bool(bool),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    Str(String),
    Array(AbiType, Vec<AbiValue>),
    FixedArray(Vec<AbiValue>),
    Tuple(Vec<AbiValue>),
}

impl Display for AbiValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbiValue::Uint(v, _) => write!(f, "{}", v),
            AbiValue::Int(v, _) => write!(f, "0x{}", hex::encode(u256_to_be(*v))),
            AbiValue::Address(a) => write!(f, "0x{}", hex::encode(a.0)),
            AbiValue::Bool(b) => write!(f, "{}", b),
            AbiValue::FixedBytes(b) | AbiValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            AbiValue::Str(s) => write!(f, "{:?}", s),
            AbiValue::Array(_, vs) | AbiValue::FixedArray(vs) | AbiValue::Tuple(vs) => {
                let inner: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", inner.join(", "))
            }
        }
    }
}

impl AbiValue {
    pub fn type_of(&self) -> AbiType {
        match self {
            AbiValue::Uint(_, bits) => AbiType::Uint(*bits),
            AbiValue::Int(_, bits) => AbiType::Int(*bits),
            AbiValue::Address(_) => AbiType::Address,
            AbiValue::Bool(_) => AbiType::Bool,
            AbiValue::FixedBytes(b) => AbiType::FixedBytes(b.len()),
            AbiValue::Bytes(_) => AbiType::Bytes,
            AbiValue::Str(_) => AbiType::String,
            AbiValue::Array(elem, _) => AbiType::Array(Box::new(elem.clone())),
            AbiValue::FixedArray(vs) => AbiType::FixedArray(
                Box::new(vs.first().map(|v| v.type_of()).unwrap_or(AbiType::Uint(256))),
                vs.len(),
            ),
            AbiValue::Tuple(vs) => AbiType::Tuple(vs.iter().map(|v| v.type_of()).collect()),
        }
    }

    fn is_dynamic(&self) -> bool {
        self.type_of().is_dynamic()
    }

    /// Encode the static head of this value, assuming `tail_offset` for
    /// dynamic members.
    fn encode_into(&self, head: &mut Vec<u8>, tail: &mut Vec<u8>, base_offset: usize) {
        if self.is_dynamic() {
            let offset = base_offset + tail.len();
            head.extend_from_slice(&u256_to_be(EVMU256::from(offset as u64)));
            tail.extend_from_slice(&self.encode_tail());
            return;
        }
        match self {
            AbiValue::Uint(v, _) | AbiValue::Int(v, _) => head.extend_from_slice(&u256_to_be(*v)),
            AbiValue::Address(a) => {
                head.extend_from_slice(&[0u8; 12]);
                head.extend_from_slice(&a.0);
            }
            AbiValue::Bool(b) => {
                head.extend_from_slice(&[0u8; 31]);
                head.push(u8::from(*b));
            }
            AbiValue::FixedBytes(b) => {
                let mut word = [0u8; 32];
                word[..b.len().min(32)].copy_from_slice(&b[..b.len().min(32)]);
                head.extend_from_slice(&word);
            }
            AbiValue::FixedArray(vs) | AbiValue::Tuple(vs) => {
                head.extend_from_slice(&encode_values(vs));
            }
            _ => unreachable!("dynamic values handled above"),
        }
    }

    /// Tail encoding of a dynamic value.
    fn encode_tail(&self) -> Vec<u8> {
        match self {
            AbiValue::Bytes(data) => encode_len_prefixed(data),
            AbiValue::Str(s) => encode_len_prefixed(s.as_bytes()),
            AbiValue::Array(_, vs) => {
                let mut out = u256_to_be(EVMU256::from(vs.len() as u64)).to_vec();
                out.extend_from_slice(&encode_values(vs));
                out
            }
            AbiValue::FixedArray(vs) | AbiValue::Tuple(vs) => encode_values(vs),
            _ => unreachable!("static values have no tail"),
        }
    }
}

fn encode_len_prefixed(data: &[u8]) -> Vec<u8> {
    let mut out = u256_to_be(EVMU256::from(data.len() as u64)).to_vec();
    out.extend_from_slice(data);
    let pad = (32 - data.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

/// Standard head/tail encoding of a value list (function arguments or the
/// members of a composite).
pub fn encode_values(values: &[AbiValue]) -> Vec<u8> {
    let head_size: usize = values.iter().map(|v| v.type_of().head_size()).sum();
    let mut head = Vec::with_capacity(head_size);
    let mut tail = vec![];
    for value in values {
        value.encode_into(&mut head, &mut tail, head_size);
    }
    head.extend_from_slice(&tail);
    head
}

/// Selector-prefixed calldata for a function invocation.
pub fn encode_call(selector: [u8; 4], args: &[AbiValue]) -> Vec<u8> {
    let mut out = selector.to_vec();
    out.extend_from_slice(&encode_values(args));
    out
}

fn read_word(data: &[u8], offset: usize) -> Result<[u8; 32], AbiError> {
    let end = offset
        .checked_add(32)
        .filter(|end| *end <= data.len())
        .ok_or(AbiError::Decode(offset))?;
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[offset..end]);
    Ok(word)
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let word = read_word(data, offset)?;
    // reject absurd offsets/lengths instead of trying to allocate them
    if word[..24].iter().any(|b| *b != 0) {
        return Err(AbiError::Decode(offset));
    }
    let v = u64::from_be_bytes(word[24..32].try_into().expect("8-byte slice"));
    usize::try_from(v).map_err(|_| AbiError::Decode(offset))
}

fn decode_one(ty: &AbiType, data: &[u8], offset: usize) -> Result<AbiValue, AbiError> {
    match ty {
        AbiType::Uint(bits) => Ok(AbiValue::Uint(be_to_u256(&read_word(data, offset)?), *bits)),
        AbiType::Int(bits) => Ok(AbiValue::Int(be_to_u256(&read_word(data, offset)?), *bits)),
        AbiType::Address => {
            let word = read_word(data, offset)?;
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&word[12..]);
            Ok(AbiValue::Address(B160(addr)))
        }
        AbiType::Bool => Ok(AbiValue::Bool(read_word(data, offset)?[31] != 0)),
        AbiType::FixedBytes(n) => Ok(AbiValue::FixedBytes(read_word(data, offset)?[..*n].to_vec())),
        AbiType::Bytes | AbiType::String => {
            let loc = read_usize(data, offset)?;
            let len = read_usize(data, loc)?;
            let end = loc
                .checked_add(32)
                .and_then(|start| start.checked_add(len))
                .filter(|end| *end <= data.len())
                .ok_or(AbiError::Decode(loc))?;
            let body = data[loc + 32..end].to_vec();
            if matches!(ty, AbiType::Bytes) {
                Ok(AbiValue::Bytes(body))
            } else {
                Ok(AbiValue::Str(String::from_utf8_lossy(&body).into_owned()))
            }
        }
        AbiType::Array(inner) => {
            let loc = read_usize(data, offset)?;
            let len = read_usize(data, loc)?;
            if len > data.len() / 32 + 1 {
                return Err(AbiError::Decode(loc));
            }
            let tys = vec![(**inner).clone(); len];
            let values = decode_values(&tys, &data[loc + 32..])?;
            Ok(AbiValue::Array((**inner).clone(), values))
        }
        AbiType::FixedArray(inner, n) => {
            let tys = vec![(**inner).clone(); *n];
            let base = if ty.is_dynamic() {
                read_usize(data, offset)?
            } else {
                offset
            };
            if base > data.len() {
                return Err(AbiError::Decode(base));
            }
            let values = decode_values(&tys, &data[base..])?;
            Ok(AbiValue::FixedArray(values))
        }
        AbiType::Tuple(parts) => {
            let base = if ty.is_dynamic() {
                read_usize(data, offset)?
            } else {
                offset
            };
            if base > data.len() {
                return Err(AbiError::Decode(base));
            }
            let values = decode_values(parts, &data[base..])?;
            Ok(AbiValue::Tuple(values))
        }
    }
}

/// Decode a value list (function arguments) from ABI-encoded `data`.
pub fn decode_values(types: &[AbiType], data: &[u8]) -> Result<Vec<AbiValue>, AbiError> {
    let mut out = Vec::with_capacity(types.len());
    let mut offset = 0usize;
    for ty in types {
        out.push(decode_one(ty, data, offset)?);
        offset += ty.head_size();
    }
    Ok(out)
}

/// One callable method of a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiFunction {
    pub name: String,
    pub inputs: Vec<AbiType>,
    pub outputs: Vec<AbiType>,
    /// view or pure: cannot mutate chain state
    pub is_view: bool,
    pub is_payable: bool,
    pub selector: [u8; 4],
    pub signature: String,
}

impl Display for AbiFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiEvent {
    pub name: String,
    pub inputs: Vec<AbiType>,
    pub indexed: Vec<bool>,
    pub topic0: [u8; 32],
}

/// Parsed contract interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractAbi {
    pub functions: Vec<AbiFunction>,
    pub constructor: Option<Vec<AbiType>>,
    pub events: Vec<AbiEvent>,
    /// custom errors, kept as selector-bearing pseudo-functions
    pub errors: Vec<AbiFunction>,
}

impl ContractAbi {
    pub fn function_by_selector(&self, selector: [u8; 4]) -> Option<&AbiFunction> {
        self.functions.iter().find(|f| f.selector == selector)
    }
}

fn component_type(input: &Value) -> Result<AbiType, AbiError> {
    let ty = input["type"]
        .as_str()
        .ok_or_else(|| AbiError::MalformedJson("input without type".into()))?;
    if let Some(components) = input.get("components") {
        // tuples carry their member list out-of-band
        let suffix = ty
            .strip_prefix("tuple")
            .ok_or_else(|| AbiError::UnknownType(ty.to_string()))?;
        let members = components
            .as_array()
            .ok_or_else(|| AbiError::MalformedJson("components is not an array".into()))?
            .iter()
            .map(component_type)
            .collect::<Result<Vec<_>, _>>()?;
        AbiType::parse(&format!("{}{}", AbiType::Tuple(members).canonical(), suffix))
    } else {
        AbiType::parse(ty)
    }
}

fn parse_inputs(entry: &Value) -> Result<Vec<AbiType>, AbiError> {
    entry["inputs"]
        .as_array()
        .unwrap_or(&vec![])
        .iter()
        .map(component_type)
        .collect()
}

/// Parse a solc-style ABI json array into a [`ContractAbi`].
pub fn parse_abi_str(data: &str) -> Result<ContractAbi, AbiError> {
    let json: Vec<Value> =
        serde_json::from_str(data).map_err(|e| AbiError::MalformedJson(e.to_string()))?;
    let mut abi = ContractAbi::default();
    for entry in &json {
        match entry["type"].as_str() {
            Some("function") => {
                let name = entry["name"]
                    .as_str()
                    .ok_or_else(|| AbiError::MalformedJson("function without name".into()))?
                    .to_string();
                let inputs = parse_inputs(entry)?;
                let outputs = entry["outputs"]
                    .as_array()
                    .unwrap_or(&vec![])
                    .iter()
                    .map(component_type)
                    .collect::<Result<Vec<_>, _>>()?;
                let mutability = entry["stateMutability"].as_str().unwrap_or("nonpayable");
                let signature = format!(
                    "{}({})",
                    name,
                    inputs.iter().map(|t| t.canonical()).collect::<Vec<_>>().join(",")
                );
                abi.functions.push(AbiFunction {
                    selector: selector_of(&signature),
                    is_view: mutability == "view" || mutability == "pure",
                    is_payable: mutability == "payable",
                    name,
                    inputs,
                    outputs,
                    signature,
                });
            }
            Some("constructor") => {
                abi.constructor = Some(parse_inputs(entry)?);
            }
            Some("event") => {
                let name = entry["name"].as_str().unwrap_or_default().to_string();
                let inputs = parse_inputs(entry)?;
                let indexed = entry["inputs"]
                    .as_array()
                    .unwrap_or(&vec![])
                    .iter()
                    .map(|i| i["indexed"].as_bool().unwrap_or(false))
                    .collect();
                let signature = format!(
                    "{}({})",
                    name,
                    inputs.iter().map(|t| t.canonical()).collect::<Vec<_>>().join(",")
                );
                abi.events.push(AbiEvent {
                    topic0: crate::types::keccak(signature.as_bytes()),
                    name,
                    inputs,
                    indexed,
                });
            }
            Some("error") => {
                let name = entry["name"].as_str().unwrap_or_default().to_string();
                let inputs = parse_inputs(entry)?;
                let signature = format!(
                    "{}({})",
                    name,
                    inputs.iter().map(|t| t.canonical()).collect::<Vec<_>>().join(",")
                );
                abi.errors.push(AbiFunction {
                    selector: selector_of(&signature),
                    is_view: false,
                    is_payable: false,
                    name,
                    inputs,
                    outputs: vec![],
                    signature,
                });
            }
            _ => {}
        }
    }
    Ok(abi)
}
