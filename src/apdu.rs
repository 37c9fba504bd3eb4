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
//! Response payload parsing and the status word taxonomy

#![deny(warnings, trivial_casts, trivial_numeric_casts)]
#![deny(unused_import_braces, unused_qualifications)]
#![deny(missing_docs)]

use std::fmt;
use std::str;

use crate::params::{PK_LEN, VERSION_RESPONSE_MIN_LEN};
use crate::DesmosError;

/// Status word signalling a successful exchange
pub const SW_OK: u16 = 0x9000;

/// Reason the app refused a request, derived from a non-success status word
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// 0x6400
    ExecutionError,
    /// 0x6700
    WrongLength,
    /// 0x6982
    EmptyBuffer,
    /// 0x6983
    OutputBufferTooSmall,
    /// 0x6984
    DataInvalid,
    /// 0x6985, e.g. a derivation path outside the default policy
    ConditionsNotSatisfied,
    /// 0x6986, e.g. an HRP the app is not configured for
    TransactionRejected,
    /// 0x6A80
    BadKeyHandle,
    /// 0x6B00
    InvalidP1P2,
    /// 0x6D00
    InsNotSupported,
    /// 0x6E00
    ClaNotSupported,
    /// 0x6F00
    UnknownError,
    /// 0x6F01
    SignVerifyError,
    /// Any other non-success status word
    Unknown(u16),
}

impl Rejection {
    /// Map a status word to a rejection. Returns `None` only for success.
    pub fn from_status_word(sw: u16) -> Option<Self> {
        match sw {
            SW_OK => None,
            0x6400 => Some(Rejection::ExecutionError),
            0x6700 => Some(Rejection::WrongLength),
            0x6982 => Some(Rejection::EmptyBuffer),
            0x6983 => Some(Rejection::OutputBufferTooSmall),
            0x6984 => Some(Rejection::DataInvalid),
            0x6985 => Some(Rejection::ConditionsNotSatisfied),
            0x6986 => Some(Rejection::TransactionRejected),
            0x6A80 => Some(Rejection::BadKeyHandle),
            0x6B00 => Some(Rejection::InvalidP1P2),
            0x6D00 => Some(Rejection::InsNotSupported),
            0x6E00 => Some(Rejection::ClaNotSupported),
            0x6F00 => Some(Rejection::UnknownError),
            0x6F01 => Some(Rejection::SignVerifyError),
            other => Some(Rejection::Unknown(other)),
        }
    }

    /// The status word this rejection was decoded from
    pub fn status_word(&self) -> u16 {
        match self {
            Rejection::ExecutionError => 0x6400,
            Rejection::WrongLength => 0x6700,
            Rejection::EmptyBuffer => 0x6982,
            Rejection::OutputBufferTooSmall => 0x6983,
            Rejection::DataInvalid => 0x6984,
            Rejection::ConditionsNotSatisfied => 0x6985,
            Rejection::TransactionRejected => 0x6986,
            Rejection::BadKeyHandle => 0x6A80,
            Rejection::InvalidP1P2 => 0x6B00,
            Rejection::InsNotSupported => 0x6D00,
            Rejection::ClaNotSupported => 0x6E00,
            Rejection::UnknownError => 0x6F00,
            Rejection::SignVerifyError => 0x6F01,
            Rejection::Unknown(sw) => *sw,
        }
    }

    /// Human readable reason, matching what the reference client reports
    pub fn description(&self) -> &'static str {
        match self {
            Rejection::ExecutionError => "Execution Error",
            Rejection::WrongLength => "Wrong Length",
            Rejection::EmptyBuffer => "Empty Buffer",
            Rejection::OutputBufferTooSmall => "Output buffer too small",
            Rejection::DataInvalid => "Data is invalid",
            Rejection::ConditionsNotSatisfied => "Conditions not satisfied",
            Rejection::TransactionRejected => "Transaction rejected",
            Rejection::BadKeyHandle => "Bad key handle",
            Rejection::InvalidP1P2 => "Invalid P1/P2",
            Rejection::InsNotSupported => "Instruction not supported",
            Rejection::ClaNotSupported => "App does not seem to be open",
            Rejection::UnknownError => "Unknown error",
            Rejection::SignVerifyError => "Sign/verify error",
            Rejection::Unknown(_) => "Unknown Status Code",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.description(), self.status_word())
    }
}

/// Desmos app version record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppVersion {
    /// Whether the app was built in test mode
    pub test_mode: bool,
    /// Version Major
    pub major: u8,
    /// Version Minor
    pub minor: u8,
    /// Version Patch
    pub patch: u8,
}

/// Address response (bech32 address plus the corresponding public key)
#[derive(Clone, Debug)]
pub struct Address {
    /// Public Key
    pub public_key: k256::PublicKey,

    /// Compressed SEC1 public key bytes as returned by the device
    pub compressed_pk: [u8; PK_LEN],

    /// Bech32 encoded address
    pub bech32_address: String,
}

/// Signature response
#[derive(Clone, Debug)]
pub struct Signature {
    /// DER encoded signature bytes as returned by the device
    pub der: Vec<u8>,

    /// Parsed signature
    pub sig: k256::ecdsa::Signature,
}

/// Parse a GetVersion response payload
pub fn parse_version<E>(data: &[u8]) -> Result<AppVersion, DesmosError<E>>
where
    E: std::error::Error,
{
    if data.len() < VERSION_RESPONSE_MIN_LEN {
        return Err(DesmosError::InvalidVersion);
    }

    Ok(AppVersion {
        test_mode: data[0] != 0,
        major: data[1],
        minor: data[2],
        patch: data[3],
    })
}

/// Parse a GetAddrSecp256k1 response payload
pub fn parse_address<E>(data: &[u8]) -> Result<Address, DesmosError<E>>
where
    E: std::error::Error,
{
    if data.len() < PK_LEN {
        return Err(DesmosError::InvalidPK);
    }
    if data.len() == PK_LEN {
        return Err(DesmosError::InvalidAddress);
    }

    let public_key = k256::PublicKey::from_sec1_bytes(&data[..PK_LEN])?;

    let mut compressed_pk = [0u8; PK_LEN];
    compressed_pk.copy_from_slice(&data[..PK_LEN]);

    let bech32_address = str::from_utf8(&data[PK_LEN..])?.to_owned();

    Ok(Address {
        public_key,
        compressed_pk,
        bech32_address,
    })
}

/// Parse a SignSecp256k1 response payload
pub fn parse_signature<E>(data: &[u8]) -> Result<Signature, DesmosError<E>>
where
    E: std::error::Error,
{
    if data.is_empty() {
        return Err(DesmosError::NoSignature);
    }

    let sig = k256::ecdsa::Signature::from_der(data)?;

    Ok(Signature {
        der: data.to_vec(),
        sig,
    })
}
