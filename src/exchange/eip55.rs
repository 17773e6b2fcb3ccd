//! EIP-55 checksum addresses
//!
//! DEX venues reject mixed-case addresses that fail the checksum; every
//! address string is converted to canonical case before any API call.

use ethers_core::utils::keccak256;

use super::errors::{ExchangeError, ExchangeResult};

/// Checksum-encode a hex address. Input case is ignored; output carries the
/// 0x prefix. Idempotent.
pub fn to_checksum_address(address: &str) -> ExchangeResult<String> {
    let stripped = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);

    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ExchangeError::Auth(format!(
            "malformed address: {}",
            address
        )));
    }

    let lower = stripped.to_lowercase();
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        if c.is_ascii_digit() {
            out.push(c);
            continue;
        }
        // Uppercase when the paired hash nibble is >= 8
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// True when the address already carries a valid EIP-55 checksum (or is
/// all-lowercase/all-uppercase, which predates the checksum scheme).
pub fn is_valid_address(address: &str) -> bool {
    let Ok(checksummed) = to_checksum_address(address) else {
        return false;
    };
    let stripped = address.strip_prefix("0x").unwrap_or(address);
    stripped == &checksummed[2..]
        || stripped == stripped.to_lowercase()
        || stripped == stripped.to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the EIP-55 specification
    const VECTORS: [&str; 4] = [
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
        "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
        "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
    ];

    #[test]
    fn checksums_reference_vectors() {
        for v in VECTORS {
            assert_eq!(to_checksum_address(&v.to_lowercase()).unwrap(), v);
        }
    }

    #[test]
    fn checksum_is_idempotent_and_case_insensitive() {
        for v in VECTORS {
            let once = to_checksum_address(v).unwrap();
            assert_eq!(to_checksum_address(&once).unwrap(), once);
            assert_eq!(to_checksum_address(&v.to_uppercase()).unwrap(), once);
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!(to_checksum_address("0x1234").is_err());
        assert!(to_checksum_address("not-an-address").is_err());
    }

    #[test]
    fn validity() {
        assert!(is_valid_address(VECTORS[0]));
        assert!(is_valid_address(&VECTORS[0].to_lowercase()));
        // One flipped case letter breaks the checksum
        let mut broken = VECTORS[0].to_string();
        broken.replace_range(3..4, "A");
        assert!(!is_valid_address(&broken));
    }
}
