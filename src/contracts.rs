/// Load compiled contract artifacts and mine literal constants from them
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use glob::glob;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::abi::{parse_abi_str, AbiError, ContractAbi};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse hex artifact {0}")]
    Hex(String),
    #[error("{0}")]
    Abi(#[from] AbiError),
    #[error("artifact json is malformed: {0}")]
    MalformedJson(String),
    #[error("no complete .abi/.bin artifact pairs under {0}")]
    NoContracts(String),
}

/// Compiled bytecode and interface of one fuzz target, plus the literal
/// constants mined from the bytecode that seed the value mutator.
#[derive(Debug, Clone)]
pub struct ContractDefinition {
    pub name: String,
    pub init_code: Vec<u8>,
    pub deployed_code: Option<Vec<u8>>,
    pub abi: ContractAbi,
    pub literals: Vec<Vec<u8>>,
}

/// Find constants in bytecode by observing PUSH instruction arguments.
/// Single-byte pushes and jump targets (operand of a PUSH directly feeding
/// JUMPI) are skipped: those are control flow, not domain values.
pub fn mine_push_literals(code: &[u8]) -> Vec<Vec<u8>> {
    let mut literals = vec![];
    let mut seen = std::collections::HashSet::new();
    let mut idx = 0usize;
    while idx < code.len() {
        let op = code[idx];
        if (0x60..=0x7f).contains(&op) {
            let width = (op - 0x5f) as usize;
            if idx + width >= code.len() {
                break;
            }
            let next_op = code.get(idx + width + 1).copied();
            let feeds_jumpi = matches!(next_op, Some(0x57));
            if width >= 2 && !feeds_jumpi {
                let operand = code[idx + 1..idx + 1 + width].to_vec();
                if seen.insert(operand.clone()) {
                    literals.push(operand);
                }
            }
            idx += width + 1;
        } else {
            idx += 1;
        }
    }
    literals
}

fn read_to_string(path: &Path) -> Result<String, LoadError> {
    let mut file =
        File::open(path).map_err(|e| LoadError::Io(path.display().to_string(), e))?;
    let mut data = String::new();
    file.read_to_string(&mut data)
        .map_err(|e| LoadError::Io(path.display().to_string(), e))?;
    Ok(data)
}

fn parse_hex_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    let data = read_to_string(path)?;
    hex::decode(data.trim().trim_start_matches("0x"))
        .map_err(|_| LoadError::Hex(path.display().to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ContractLoader {
    pub contracts: Vec<ContractDefinition>,
}

impl ContractLoader {
    /// Load contracts from a directory laid out as compiler output pairs:
    /// `Name.abi` + `Name.bin` (+ optional `Name.bin-runtime`).
    pub fn from_artifact_dir(dir: &str) -> Result<Self, LoadError> {
        let pattern = format!("{}/*", dir.trim_end_matches('/'));
        let mut prefixes: HashMap<String, bool> = HashMap::new();
        for entry in glob(&pattern).map_err(|e| LoadError::MalformedJson(e.to_string()))? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("skipping unreadable artifact: {:?}", e);
                    continue;
                }
            };
            let name = path.display().to_string();
            if let Some(prefix) = name.strip_suffix(".abi") {
                prefixes.entry(prefix.to_string()).or_insert(false);
            } else if let Some(prefix) = name.strip_suffix(".bin") {
                prefixes.entry(prefix.to_string()).and_modify(|has_bin| *has_bin = true).or_insert(true);
            }
        }

        let mut contracts = vec![];
        let mut names: Vec<&String> = prefixes.keys().collect();
        names.sort();
        for prefix in names {
            let abi_path = format!("{}.abi", prefix);
            let bin_path = format!("{}.bin", prefix);
            if !Path::new(&abi_path).exists() || !Path::new(&bin_path).exists() {
                debug!("ignoring incomplete artifact pair {}", prefix);
                continue;
            }
            let abi = parse_abi_str(&read_to_string(Path::new(&abi_path))?)?;
            let init_code = parse_hex_file(Path::new(&bin_path))?;
            let runtime_path = format!("{}.bin-runtime", prefix);
            let deployed_code = if Path::new(&runtime_path).exists() {
                Some(parse_hex_file(Path::new(&runtime_path))?)
            } else {
                None
            };
            let mut literals = mine_push_literals(&init_code);
            if let Some(runtime) = &deployed_code {
                for lit in mine_push_literals(runtime) {
                    if !literals.contains(&lit) {
                        literals.push(lit);
                    }
                }
            }
            let name = Path::new(prefix)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| prefix.clone());
            debug!(
                "loaded contract {} ({} methods, {} mined literals)",
                name,
                abi.functions.len(),
                literals.len()
            );
            contracts.push(ContractDefinition {
                name,
                init_code,
                deployed_code,
                abi,
                literals,
            });
        }
        if contracts.is_empty() {
            return Err(LoadError::NoContracts(dir.to_string()));
        }
        Ok(Self { contracts })
    }

    /// Load contracts from a solc `--combined-json abi,bin,bin-runtime`
    /// output file (the project-toolchain platform).
    pub fn from_combined_json(path: &str) -> Result<Self, LoadError> {
        let json: Value = serde_json::from_str(&read_to_string(Path::new(path))?)
            .map_err(|e| LoadError::MalformedJson(e.to_string()))?;
        let entries = json["contracts"]
            .as_object()
            .ok_or_else(|| LoadError::MalformedJson("contracts key not found".into()))?;

        let mut contracts = vec![];
        for (full_name, info) in entries {
            // names are "path/to/file.sol:Contract"
            let name = full_name
                .rsplit(':')
                .next()
                .unwrap_or(full_name.as_str())
                .to_string();
            let abi_raw = match &info["abi"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let abi = parse_abi_str(&abi_raw)?;
            let bin = info["bin"].as_str().unwrap_or_default();
            if bin.is_empty() {
                debug!("skipping abstract contract {}", name);
                continue;
            }
            let init_code =
                hex::decode(bin).map_err(|_| LoadError::Hex(full_name.clone()))?;
            let deployed_code = info["bin-runtime"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(hex::decode)
                .transpose()
                .map_err(|_| LoadError::Hex(full_name.clone()))?;
            let mut literals = mine_push_literals(&init_code);
            if let Some(runtime) = &deployed_code {
                for lit in mine_push_literals(runtime) {
                    if !literals.contains(&lit) {
                        literals.push(lit);
                    }
                }
            }
            contracts.push(ContractDefinition {
                name,
                init_code,
                deployed_code,
                abi,
                literals,
            });
        }
        if contracts.is_empty() {
            return Err(LoadError::NoContracts(path.to_string()));
        }
        contracts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { contracts })
    }
}
