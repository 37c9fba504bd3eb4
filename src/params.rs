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
#![deny(warnings, trivial_casts, trivial_numeric_casts)]
#![deny(unused_import_braces, unused_qualifications)]
#![deny(missing_docs)]

/// APDU Class byte
pub const CLA: u8 = 0x55;

/// Compressed SEC1 public key length
pub const PK_LEN: usize = 33;

/// Maximum payload bytes carried by a single sign chunk
pub const USER_MESSAGE_CHUNK_SIZE: usize = 250;

/// Version response minimum length: test mode flag + three version bytes
pub const VERSION_RESPONSE_MIN_LEN: usize = 4;

/// BIP44 purpose value
pub const BIP44_PURPOSE: u32 = 44;

/// Desmos coin type
pub const DESMOS_COIN_TYPE: u32 = 852;

/// BIP44 hardened derivation flag
pub const BIP44_HARDENED: u32 = 0x8000_0000;

/// P1 value: return the address without involving the user
pub const P1_ONLY_RETRIEVE: u8 = 0x00;

/// P1 value: show the address on the device and wait for confirmation
pub const P1_SHOW_ADDRESS: u8 = 0x01;

/// APDU instruction codes
#[repr(u8)]
pub enum InstructionCode {
    /// Get app version and test mode flag
    GetVersion = 0,
    /// Sign a transaction using secp256k1
    SignSecp256k1 = 2,
    /// Get bech32 address and public key using secp256k1
    GetAddrSecp256k1 = 4,
}
