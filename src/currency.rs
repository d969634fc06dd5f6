use std::{fmt, str::FromStr};

use bitcoin::{
    base58,
    bech32::{self, FromBase32, Variant},
    opcodes::all::{OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160},
    script::{Builder, PushBytes},
    ScriptBuf,
};
use serde::{Deserialize, Serialize};

use crate::errors::{CustodyError, Result};

/// Outputs below this value are folded into the fee instead of becoming change.
/// Applied to both currencies.
pub const DUST_THRESHOLD: u64 = 546;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Btc,
    Ltc,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Btc, Currency::Ltc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Ltc => "LTC",
        }
    }

    pub fn min_confirmations(&self) -> i64 {
        match self {
            Currency::Btc => 3,
            Currency::Ltc => 6,
        }
    }

    pub fn status_for(&self, confirmations: i64) -> &'static str {
        if confirmations >= self.min_confirmations() {
            crate::db::Utxo::STATUS_CONFIRMED
        } else {
            crate::db::Utxo::STATUS_UNCONFIRMED
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "LTC" => Ok(Currency::Ltc),
            _ => Err(CustodyError::UnknownCurrency(s.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn new_from_str(v: &str) -> Self {
        match v {
            "testnet" => Self::Testnet,
            _ => Self::Mainnet,
        }
    }
}

/// Encoding and policy parameters of one currency on one network.
#[derive(Debug)]
pub struct ChainParams {
    pub currency: Currency,
    pub network: Network,
    pub bech32_hrp: &'static str,
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub wif: u8,
    pub bip32_public: u32,
    pub bip32_private: u32,
    pub message_prefix: &'static str,
    /// `{coin}/{chain}` path segment of the explorer API.
    pub explorer_path: &'static str,
}

static BTC_MAINNET: ChainParams = ChainParams {
    currency: Currency::Btc,
    network: Network::Mainnet,
    bech32_hrp: "bc",
    pubkey_hash: 0x00,
    script_hash: 0x05,
    wif: 0x80,
    bip32_public: 0x0488_b21e,
    bip32_private: 0x0488_ade4,
    message_prefix: "\x18Bitcoin Signed Message:\n",
    explorer_path: "btc/main",
};

static BTC_TESTNET: ChainParams = ChainParams {
    currency: Currency::Btc,
    network: Network::Testnet,
    bech32_hrp: "tb",
    pubkey_hash: 0x6f,
    script_hash: 0xc4,
    wif: 0xef,
    bip32_public: 0x0435_87cf,
    bip32_private: 0x0435_8394,
    message_prefix: "\x18Bitcoin Signed Message:\n",
    explorer_path: "btc/test3",
};

static LTC_MAINNET: ChainParams = ChainParams {
    currency: Currency::Ltc,
    network: Network::Mainnet,
    bech32_hrp: "ltc",
    pubkey_hash: 0x30,
    script_hash: 0x32,
    wif: 0xb0,
    bip32_public: 0x019d_a462,
    bip32_private: 0x019d_9cfe,
    message_prefix: "\x19Litecoin Signed Message:\n",
    explorer_path: "ltc/main",
};

static LTC_TESTNET: ChainParams = ChainParams {
    currency: Currency::Ltc,
    network: Network::Testnet,
    bech32_hrp: "tltc",
    pubkey_hash: 0x6f,
    script_hash: 0x3a,
    wif: 0xef,
    bip32_public: 0x0436_f6e1,
    bip32_private: 0x0436_ef7d,
    message_prefix: "\x19Litecoin Signed Message:\n",
    explorer_path: "ltc/test",
};

impl ChainParams {
    // Every (currency, network) pair has its own entry, there is no fallback arm.
    pub fn lookup(currency: Currency, network: Network) -> &'static ChainParams {
        match (currency, network) {
            (Currency::Btc, Network::Mainnet) => &BTC_MAINNET,
            (Currency::Btc, Network::Testnet) => &BTC_TESTNET,
            (Currency::Ltc, Network::Mainnet) => &LTC_MAINNET,
            (Currency::Ltc, Network::Testnet) => &LTC_TESTNET,
        }
    }

    /// Decodes an address of this currency into its output script.
    ///
    /// Segwit addresses are matched on the bech32 human readable part and
    /// legacy ones on the base58 version byte, so an address of the other
    /// currency never decodes.
    pub fn script_for_address(&self, address: &str) -> Result<ScriptBuf> {
        let invalid = || CustodyError::InvalidAddress {
            currency: self.currency,
            address: address.to_owned(),
        };

        let lowered = address.to_ascii_lowercase();
        if lowered.starts_with(&format!("{}1", self.bech32_hrp)) {
            let (hrp, data, variant) = bech32::decode(address).map_err(|_| invalid())?;
            if hrp != self.bech32_hrp || data.is_empty() {
                return Err(invalid());
            }

            let version = data[0].to_u8();
            let program = Vec::<u8>::from_base32(&data[1..]).map_err(|_| invalid())?;
            let valid = match version {
                0 => variant == Variant::Bech32 && (program.len() == 20 || program.len() == 32),
                1..=16 => variant == Variant::Bech32m && (2..=40).contains(&program.len()),
                _ => false,
            };
            if !valid {
                return Err(invalid());
            }

            let push: &PushBytes = program.as_slice().try_into().map_err(|_| invalid())?;
            return Ok(Builder::new()
                .push_int(version as i64)
                .push_slice(push)
                .into_script());
        }

        let data = base58::decode_check(address).map_err(|_| invalid())?;
        if data.len() != 21 {
            return Err(invalid());
        }
        let hash: &PushBytes = data[1..].try_into().map_err(|_| invalid())?;

        if data[0] == self.pubkey_hash {
            Ok(Builder::new()
                .push_opcode(OP_DUP)
                .push_opcode(OP_HASH160)
                .push_slice(hash)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_CHECKSIG)
                .into_script())
        } else if data[0] == self.script_hash {
            Ok(Builder::new()
                .push_opcode(OP_HASH160)
                .push_slice(hash)
                .push_opcode(OP_EQUAL)
                .into_script())
        } else {
            Err(invalid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_script(address: &str) -> ScriptBuf {
        bitcoin::Address::from_str(address)
            .unwrap()
            .assume_checked()
            .script_pubkey()
    }

    #[test]
    fn currency_parsing() {
        assert_eq!(Currency::from_str("btc").unwrap(), Currency::Btc);
        assert_eq!(Currency::from_str("LTC").unwrap(), Currency::Ltc);
        assert!(matches!(
            Currency::from_str("ETH"),
            Err(CustodyError::UnknownCurrency(_))
        ));
        assert_eq!(Currency::Ltc.to_string(), "LTC");
    }

    #[test]
    fn confirmation_thresholds() {
        assert_eq!(Currency::Btc.status_for(2), "unconfirmed");
        assert_eq!(Currency::Btc.status_for(3), "confirmed");
        assert_eq!(Currency::Ltc.status_for(5), "unconfirmed");
        assert_eq!(Currency::Ltc.status_for(6), "confirmed");
    }

    #[test]
    fn tables_are_distinct() {
        let btc = ChainParams::lookup(Currency::Btc, Network::Mainnet);
        let ltc = ChainParams::lookup(Currency::Ltc, Network::Mainnet);

        assert!(!std::ptr::eq(btc, ltc));
        assert_eq!(btc.currency, Currency::Btc);
        assert_eq!(ltc.currency, Currency::Ltc);
        assert_ne!(btc.wif, ltc.wif);
        assert_ne!(btc.bip32_private, ltc.bip32_private);
        assert_eq!(ltc.wif, 0xb0);
        assert_eq!(ltc.bip32_public, 0x019d_a462);
        assert!(ltc.message_prefix.contains("Litecoin"));

        for currency in Currency::ALL {
            for network in [Network::Mainnet, Network::Testnet] {
                let p = ChainParams::lookup(currency, network);
                assert_eq!(p.currency, currency);
                assert_eq!(p.network, network);
            }
        }
    }

    #[test]
    fn btc_addresses_match_rust_bitcoin() {
        let params = ChainParams::lookup(Currency::Btc, Network::Mainnet);
        for address in [
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
        ] {
            assert_eq!(
                params.script_for_address(address).unwrap(),
                btc_script(address)
            );
        }
    }

    #[test]
    fn ltc_addresses_use_ltc_versions() {
        let params = ChainParams::lookup(Currency::Ltc, Network::Mainnet);

        // same key hash, encoded with each currency's own parameters
        let segwit = params
            .script_for_address("ltc1qw508d6qejxtdg4y5r3zarvary0c5xw7kgmn4n9")
            .unwrap();
        assert_eq!(
            segwit,
            btc_script("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
        );

        let p2pkh = params
            .script_for_address("LVuDpNCSSj6pQ7t9Pv6d6sUkLKoqDEVUnJ")
            .unwrap();
        assert_eq!(p2pkh, btc_script("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"));

        let p2sh = params
            .script_for_address("MJaRnao1s62a2zAKSkmG582KbLKianqb7v")
            .unwrap();
        assert_eq!(p2sh, btc_script("3CNHUhP3uyB9EUtRLsmvFUmvGdjGdkTxJw"));
    }

    #[test]
    fn cross_currency_addresses_are_rejected() {
        let btc = ChainParams::lookup(Currency::Btc, Network::Mainnet);
        let ltc = ChainParams::lookup(Currency::Ltc, Network::Mainnet);

        assert!(btc
            .script_for_address("ltc1qw508d6qejxtdg4y5r3zarvary0c5xw7kgmn4n9")
            .is_err());
        assert!(btc
            .script_for_address("LVuDpNCSSj6pQ7t9Pv6d6sUkLKoqDEVUnJ")
            .is_err());
        assert!(ltc
            .script_for_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .is_err());
        assert!(matches!(
            ltc.script_for_address("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"),
            Err(CustodyError::InvalidAddress {
                currency: Currency::Ltc,
                ..
            })
        ));
    }

    #[test]
    fn testnet_tables() {
        let btc = ChainParams::lookup(Currency::Btc, Network::Testnet);
        let ltc = ChainParams::lookup(Currency::Ltc, Network::Testnet);

        let expected = btc_script("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
        assert_eq!(
            btc.script_for_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
                .unwrap(),
            expected
        );
        assert_eq!(
            ltc.script_for_address("tltc1qw508d6qejxtdg4y5r3zarvary0c5xw7klfsuq0")
                .unwrap(),
            expected
        );
        assert!(ltc
            .script_for_address("QXHFfTBKYXjaaTH1e7Rox8CcdNPGHVhM59")
            .is_ok());
        assert!(btc
            .script_for_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .is_err());
    }
}
