/*******************************************************************************
*   (c) 2020 ZondaX GmbH
*
*  Licensed under the Apache License, Version 2.0 (the "License");
*  you may not use this file except in compliance with the License.
*  You may obtain a copy of the License at
*
*      http://www.apache.org/licenses/LICENSE-2.0
*
*  Unless required by applicable law or agreed to in writing, software
*  distributed under the License is distributed on an "AS IS" BASIS,
*  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*  See the License for the specific language governing permissions and
*  limitations under the License.
********************************************************************************/
//! Verification of device answers against the keys the app reported

#![deny(warnings, trivial_casts, trivial_numeric_casts)]
#![deny(unused_import_braces, unused_qualifications)]
#![deny(missing_docs)]

use bech32::{Bech32, Hrp};
use k256::ecdsa::signature::DigestVerifier;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// Address derivation failure
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// The public key is not a valid SEC1 point
    #[error("invalid public key: {0}")]
    InvalidKey(#[from] k256::elliptic_curve::Error),

    /// The HRP is not a valid bech32 prefix
    #[error("invalid bech32 prefix")]
    InvalidHrp,

    /// The account bytes could not be bech32 encoded
    #[error("bech32 encoding failed")]
    Encode,
}

/// Check a DER encoded secp256k1 signature over `payload` against a
/// compressed public key.
///
/// The message hash is the SHA-256 digest of the payload. A malformed key
/// or signature verifies as `false`, so a bad device answer shows up as a
/// failed check instead of aborting the scenario.
pub fn verify_signature(payload: &[u8], der_signature: &[u8], compressed_pk: &[u8]) -> bool {
    let verifying_key = match VerifyingKey::from_sec1_bytes(compressed_pk) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = match k256::ecdsa::Signature::from_der(der_signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    verifying_key
        .verify_digest(Sha256::new_with_prefix(payload), &signature)
        .is_ok()
}

/// Re-derive the Ethereum-style bech32 address for a compressed key:
/// Keccak-256 over the uncompressed point, low-order 20 bytes, bech32
/// encoded under `hrp`
pub fn eth_style_address(compressed_pk: &[u8], hrp: &str) -> Result<String, AddressError> {
    let public_key = k256::PublicKey::from_sec1_bytes(compressed_pk)?;
    let point = public_key.to_encoded_point(false);

    // drop the 0x04 tag, hash the 64 byte point, keep the trailing 20 bytes
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let account = &digest[12..];

    let hrp = Hrp::parse(hrp).map_err(|_| AddressError::InvalidHrp)?;
    bech32::encode::<Bech32>(hrp, account).map_err(|_| AddressError::Encode)
}

/// Compare the address the device reported against an independent
/// re-derivation from the key it returned.
///
/// A mismatch is a verification failure regardless of the status word the
/// device answered with.
pub fn verify_address(compressed_pk: &[u8], hrp: &str, claimed_address: &str) -> bool {
    match eth_style_address(compressed_pk, hrp) {
        Ok(derived) => derived == claimed_address,
        Err(_) => false,
    }
}
