/// Console precompile: formatted contract logging bridged to the logging
/// subsystem.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use tracing::info;

use crate::abi::{decode_values, AbiType, AbiValue};
use crate::types::selector_of;
use revm::primitives::B160;

/// 0x000000000000000000636F6e736F6c652e6c6f67 ("console.log")
pub const CONSOLE_ADDRESS: B160 = B160([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0x63, 0x6f, 0x6e, 0x73, 0x6f, 0x6c, 0x65, 0x2e, 0x6c, 0x6f, 0x67,
]);

static SIGNATURES: Lazy<HashMap<[u8; 4], Vec<AbiType>>> = Lazy::new(|| {
    let sigs: &[&str] = &[
        "log(string)",
        "log(uint256)",
        "log(int256)",
        "log(address)",
        "log(bool)",
        "log(bytes)",
        "log(bytes32)",
        "log(string,uint256)",
        "log(string,address)",
        "log(string,bool)",
        "log(string,string)",
        "log(uint256,uint256)",
        "log(string,uint256,uint256)",
    ];
    sigs.iter()
        .map(|sig| {
            let args = &sig[sig.find('(').expect("signature has args") + 1..sig.len() - 1];
            let inputs = if args.is_empty() {
                vec![]
            } else {
                args.split(',')
                    .map(|a| AbiType::parse(a).expect("console signature type"))
                    .collect()
            };
            (selector_of(sig), inputs)
        })
        .collect()
});

fn render(values: &[AbiValue]) -> String {
    values
        .iter()
        .map(|v| match v {
            AbiValue::Str(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a call to the console address and emit it through `tracing`.
/// Unknown overloads log their raw calldata rather than failing the call.
pub fn log(calldata: &[u8]) {
    if calldata.len() < 4 {
        return;
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&calldata[..4]);
    match SIGNATURES
        .get(&selector)
        .and_then(|inputs| decode_values(inputs, &calldata[4..]).ok())
    {
        Some(values) => info!(target: "console", "{}", render(&values)),
        None => info!(target: "console", "raw: 0x{}", hex::encode(calldata)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::encode_call;
    use crate::types::EVMU256;

    #[test]
    fn test_known_overloads_decode() {
        let data = encode_call(
            selector_of("log(string,uint256)"),
            &[
                AbiValue::Str("balance".into()),
                AbiValue::Uint(EVMU256::from(5u64), 256),
            ],
        );
        let selector: [u8; 4] = data[..4].try_into().unwrap();
        let inputs = SIGNATURES.get(&selector).unwrap();
        let values = decode_values(inputs, &data[4..]).unwrap();
        assert_eq!(render(&values), "balance 5");
    }

    #[test]
    fn test_log_tolerates_garbage() {
        // must not panic
        log(&[]);
        log(&[1, 2, 3, 4, 5]);
    }
}
