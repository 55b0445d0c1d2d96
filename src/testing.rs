//! Helpers shared by the unit tests.

use anyhow::Result;

use crate::{FormBuilder, Pkcs7Signer};

/// Deterministic stand-in for a real signer. Produces a small DER value
/// holding a checksum of the signed bytes.
pub struct FakeSigner(pub &'static str);

impl FakeSigner {
    pub fn expected_signature(signed_data: [&[u8]; 2]) -> Vec<u8> {
        let checksum = signed_data
            .iter()
            .flat_map(|d| d.iter())
            .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let mut der = vec![0x30, 0x06, 0x04, 0x04];
        der.extend(checksum.to_be_bytes());
        der
    }
}

impl Pkcs7Signer for FakeSigner {
    fn signer_name(&self) -> &str {
        self.0
    }

    fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>> {
        Ok(Self::expected_signature(signed_data))
    }
}

pub fn three_signer_form() -> Vec<u8> {
    FormBuilder::new()
        .field("sig1", "Signer 1: Alice")
        .field("sig2", "Signer 2: Bob")
        .field("sig3", "Signer 3: Carol")
        .to_bytes()
        .unwrap()
}
