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
//! Support library for validating the Desmos Ledger apps
//!
//! Covers the full exchange with the app: building and parsing APDUs,
//! driving the on-screen confirmation flow of an emulated device, and
//! verifying that returned signatures and addresses match the keys the
//! app reported.

#![deny(warnings, trivial_casts, trivial_numeric_casts)]
#![deny(unused_import_braces, unused_qualifications)]
#![deny(missing_docs)]
#![doc(html_root_url = "https://docs.rs/ledger-desmos/0.1.0")]

use byteorder::{LittleEndian, WriteBytesExt};
use ledger_transport::{APDUCommand, Exchange};
use ledger_zondax_generic::{App, AppExt, ChunkPayloadType};

mod params;
use params::{
    InstructionCode, BIP44_HARDENED, CLA, P1_ONLY_RETRIEVE, P1_SHOW_ADDRESS,
    USER_MESSAGE_CHUNK_SIZE,
};

pub mod apdu;
pub mod verify;
pub mod zemu;

pub use apdu::{Address, AppVersion, Rejection, Signature};
pub use ledger_zondax_generic::LedgerAppError;
pub use params::{BIP44_PURPOSE, DESMOS_COIN_TYPE};

/// Ledger App Error
#[derive(Debug, thiserror::Error)]
pub enum DesmosError<E: std::error::Error> {
    /// Invalid version response
    #[error("This version is not supported")]
    InvalidVersion,

    /// Public Key is invalid
    #[error("received an invalid PK")]
    InvalidPK,

    /// Address field absent or malformed
    #[error("received an invalid address")]
    InvalidAddress,

    /// No signature has been returned
    #[error("received no signature back")]
    NoSignature,

    /// The app refused the request with a known status word
    #[error("request rejected by the app: {0}")]
    Rejected(Rejection),

    /// Device related errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerAppError<E>),

    /// Device related errors
    #[error("Secp256k1 error: {0}")]
    Secp256k1(#[from] k256::elliptic_curve::Error),

    /// Device related errors
    #[error("Ecdsa error: {0}")]
    Ecdsa(#[from] k256::ecdsa::Error),

    /// Utf8 conversion related error
    #[error("UTF8Error error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// BIP44 Path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BIP44Path {
    /// Purpose
    pub purpose: u32,
    /// Coin
    pub coin: u32,
    /// Account
    pub account: u32,
    /// Change
    pub change: u32,
    /// Address Index
    pub index: u32,
}

impl BIP44Path {
    /// Build a path from its five components, in
    /// `m / purpose / coin / account / change / index` order
    pub const fn new(components: [u32; 5]) -> Self {
        BIP44Path {
            purpose: components[0],
            coin: components[1],
            account: components[2],
            change: components[3],
            index: components[4],
        }
    }

    /// Serialize in the app's wire layout: five little-endian words,
    /// the first three forced to hardened derivation
    pub fn serialize(&self) -> Vec<u8> {
        let mut m = Vec::with_capacity(20);

        m.write_u32::<LittleEndian>(self.purpose | BIP44_HARDENED)
            .unwrap();
        m.write_u32::<LittleEndian>(self.coin | BIP44_HARDENED).unwrap();
        m.write_u32::<LittleEndian>(self.account | BIP44_HARDENED)
            .unwrap();
        m.write_u32::<LittleEndian>(self.change).unwrap();
        m.write_u32::<LittleEndian>(self.index).unwrap();

        m
    }

    /// Serialize the path followed by the length-prefixed HRP bytes.
    ///
    /// No range validation happens on this side; the app is the authority
    /// on which paths and prefixes it accepts.
    pub fn serialize_with_hrp(&self, hrp: &str) -> Vec<u8> {
        let mut m = self.serialize();
        m.push(hrp.len() as u8);
        m.extend_from_slice(hrp.as_bytes());
        m
    }
}

/// Desmos App
pub struct DesmosApp<E> {
    transport: E,
}

impl<E> App for DesmosApp<E> {
    const CLA: u8 = CLA;
}

impl<E> DesmosApp<E> {
    /// Connect to the app through the given transport
    pub const fn new(transport: E) -> Self {
        DesmosApp { transport }
    }
}

impl<E> DesmosApp<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Retrieve the app version
    pub async fn version(&self) -> Result<AppVersion, DesmosError<E::Error>> {
        let command = APDUCommand {
            cla: CLA,
            ins: InstructionCode::GetVersion as u8,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };

        let response = self
            .transport
            .exchange(&command)
            .await
            .map_err(LedgerAppError::TransportError)?;

        if let Some(rejection) = Rejection::from_status_word(response.retcode()) {
            return Err(DesmosError::Rejected(rejection));
        }

        apdu::parse_version(response.data())
    }

    /// Retrieve the public key and address without involving the user
    pub async fn get_address_and_pub_key(
        &self,
        path: &BIP44Path,
        hrp: &str,
    ) -> Result<Address, DesmosError<E::Error>> {
        self.address(path, hrp, false).await
    }

    /// Show the address on the device; the response resolves once the
    /// user confirms or rejects the review
    pub async fn show_address_and_pub_key(
        &self,
        path: &BIP44Path,
        hrp: &str,
    ) -> Result<Address, DesmosError<E::Error>> {
        self.address(path, hrp, true).await
    }

    async fn address(
        &self,
        path: &BIP44Path,
        hrp: &str,
        require_confirmation: bool,
    ) -> Result<Address, DesmosError<E::Error>> {
        let p1 = if require_confirmation {
            P1_SHOW_ADDRESS
        } else {
            P1_ONLY_RETRIEVE
        };

        let command = APDUCommand {
            cla: CLA,
            ins: InstructionCode::GetAddrSecp256k1 as u8,
            p1,
            p2: 0x00,
            data: path.serialize_with_hrp(hrp),
        };

        let response = self
            .transport
            .exchange(&command)
            .await
            .map_err(LedgerAppError::TransportError)?;

        if let Some(rejection) = Rejection::from_status_word(response.retcode()) {
            return Err(DesmosError::Rejected(rejection));
        }

        apdu::parse_address(response.data())
    }

    /// Sign a transaction.
    ///
    /// The sign doc is streamed to the device in chunks after an initial
    /// packet carrying the derivation path; callers always deal with one
    /// logical message regardless of its size.
    pub async fn sign(
        &self,
        path: &BIP44Path,
        message: &[u8],
    ) -> Result<Signature, DesmosError<E::Error>> {
        if message.is_empty() {
            return Err(DesmosError::Ledger(LedgerAppError::InvalidEmptyMessage));
        }
        if message.chunks(USER_MESSAGE_CHUNK_SIZE).len() > 255 {
            return Err(DesmosError::Ledger(LedgerAppError::InvalidMessageSize));
        }

        let start_command = APDUCommand {
            cla: CLA,
            ins: InstructionCode::SignSecp256k1 as u8,
            p1: ChunkPayloadType::Init as u8,
            p2: 0x00,
            data: path.serialize(),
        };

        log::debug!("streaming {} sign doc bytes to the device", message.len());

        let response =
            match <Self as AppExt<E>>::send_chunks(&self.transport, start_command, message).await {
                Ok(response) => response,
                Err(LedgerAppError::AppSpecific(code, description)) => {
                    return Err(match Rejection::from_status_word(code) {
                        Some(rejection) => DesmosError::Rejected(rejection),
                        None => {
                            DesmosError::Ledger(LedgerAppError::AppSpecific(code, description))
                        }
                    });
                }
                Err(err) => return Err(DesmosError::Ledger(err)),
            };

        apdu::parse_signature(response.data())
    }
}
