//! Proxy detection from implementation storage slots.

use alloy::primitives::{b256, Address, B256};

/// bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)
pub const EIP1967_IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// keccak256("org.zeppelinos.proxy.implementation"), used by pre-1967
/// OpenZeppelin proxies.
pub const LEGACY_IMPLEMENTATION_SLOT: B256 =
    b256!("7050c9e0f4ca769c69bd3a8ef740bc37934f8e2c036e5a723fd8ee048ed3f8c3");

/// Whether a contract is a proxy, and if so where its logic lives.
///
/// Only constructed through [`ProxyInfo::not_proxy`], [`ProxyInfo::proxy`]
/// or [`resolve_proxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInfo {
    implementation: Option<Address>,
}

impl ProxyInfo {
    pub fn not_proxy() -> Self {
        Self {
            implementation: None,
        }
    }

    pub fn proxy(implementation: Address) -> Self {
        Self {
            implementation: Some(implementation),
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.implementation.is_some()
    }

    pub fn implementation(&self) -> Option<Address> {
        self.implementation
    }

    /// EIP-55 checksummed implementation address, empty when not a proxy.
    pub fn implementation_address(&self) -> String {
        self.implementation
            .map(|a| a.to_checksum(None))
            .unwrap_or_default()
    }
}

/// Decide proxy status from the two slot words.
///
/// Precedence: both zero → not a proxy; EIP-1967 non-zero → EIP-1967 wins
/// (even when the legacy slot is also set); otherwise the legacy slot.
pub fn resolve_proxy(eip1967_word: B256, legacy_word: B256) -> ProxyInfo {
    match (eip1967_word.is_zero(), legacy_word.is_zero()) {
        (true, true) => ProxyInfo::not_proxy(),
        (false, _) => ProxyInfo::proxy(word_to_address(eip1967_word)),
        (true, false) => ProxyInfo::proxy(word_to_address(legacy_word)),
    }
}

// Address is the low 20 bytes of the word.
fn word_to_address(word: B256) -> Address {
    Address::from_slice(&word.0[12..])
}
