//! Network capability registry and transfer classification
//!
//! Static, queryable facts about the networks the orchestrator can escrow
//! across. Pure lookup, no state. `classify` is the single place the
//! same-chain / cross-chain decision is made; callers cache its result on the
//! deal and never re-derive it.

use crate::error::{EscrowError, EscrowResult};

use serde::{Deserialize, Serialize};

/// Facts about one supported network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Stable identifier used in deal records, e.g. "ethereum"
    pub id: String,
    pub display_name: String,
    pub chain_id: u64,
    pub evm_compatible: bool,
    /// Symbol of the native asset
    pub native_asset: String,
}

/// Reference to a non-native asset; `None` on a deal means native
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub symbol: String,
    /// Contract address where the asset is a deployed token
    pub token_address: Option<String>,
}

/// Shape of the value transfer a deal requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    SameChain,
    SameChainSwap,
    CrossChainBridge,
    CrossChainSwapBridge,
}

impl TransferKind {
    pub fn is_cross_chain(&self) -> bool {
        matches!(
            self,
            TransferKind::CrossChainBridge | TransferKind::CrossChainSwapBridge
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::SameChain => "same_chain",
            TransferKind::SameChainSwap => "same_chain_swap",
            TransferKind::CrossChainBridge => "cross_chain_bridge",
            TransferKind::CrossChainSwapBridge => "cross_chain_swap_bridge",
        }
    }
}

/// Registry of supported networks
pub struct NetworkRegistry {
    networks: Vec<NetworkInfo>,
}

impl NetworkRegistry {
    /// Registry with the built-in network set
    pub fn builtin() -> Self {
        let mk = |id: &str, name: &str, chain_id: u64, evm: bool, native: &str| NetworkInfo {
            id: id.to_string(),
            display_name: name.to_string(),
            chain_id,
            evm_compatible: evm,
            native_asset: native.to_string(),
        };

        Self {
            networks: vec![
                mk("ethereum", "Ethereum", 1, true, "ETH"),
                mk("polygon", "Polygon", 137, true, "POL"),
                mk("arbitrum", "Arbitrum One", 42161, true, "ETH"),
                mk("optimism", "Optimism", 10, true, "ETH"),
                mk("base", "Base", 8453, true, "ETH"),
                mk("avalanche", "Avalanche C-Chain", 43114, true, "AVAX"),
                mk("bsc", "BNB Smart Chain", 56, true, "BNB"),
            ],
        }
    }

    /// Look up a network by its identifier
    pub fn get(&self, id: &str) -> Option<&NetworkInfo> {
        self.networks.iter().find(|n| n.id == id)
    }

    /// Look up a network, failing with `UnknownNetwork`
    pub fn require(&self, id: &str) -> EscrowResult<&NetworkInfo> {
        self.get(id).ok_or_else(|| EscrowError::UnknownNetwork {
            network: id.to_string(),
        })
    }

    pub fn all(&self) -> &[NetworkInfo] {
        &self.networks
    }

    /// Classify the transfer a deal requires. Same network with the escrowed
    /// asset being native is a plain transfer; a token on the same network
    /// needs a swap leg. Across networks, the transfer is a bare bridge only
    /// when the asset exists under the same symbol on both sides (tokens, or
    /// matching native assets); otherwise a swap leg is needed as well.
    pub fn classify(
        &self,
        buyer_network: &str,
        seller_network: &str,
        asset: Option<&AssetRef>,
    ) -> EscrowResult<TransferKind> {
        let source = self.require(buyer_network)?;
        let destination = self.require(seller_network)?;

        if source.id == destination.id {
            return Ok(match asset {
                None => TransferKind::SameChain,
                Some(a) if a.symbol == source.native_asset => TransferKind::SameChain,
                Some(_) => TransferKind::SameChainSwap,
            });
        }

        let bridgeable = match asset {
            // Native on both ends: bridgeable only when the native assets match
            None => source.native_asset == destination.native_asset,
            // Token assets are assumed deployed under the same symbol on both
            // sides; a token that is one side's native asset is not
            Some(a) => {
                a.token_address.is_some()
                    && a.symbol != source.native_asset
                    && a.symbol != destination.native_asset
            }
        };

        Ok(if bridgeable {
            TransferKind::CrossChainBridge
        } else {
            TransferKind::CrossChainSwapBridge
        })
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(symbol: &str) -> AssetRef {
        AssetRef {
            symbol: symbol.to_string(),
            token_address: Some("0xdeadbeef00000000000000000000000000000000".to_string()),
        }
    }

    #[test]
    fn test_lookup() {
        let reg = NetworkRegistry::builtin();
        assert_eq!(reg.get("ethereum").unwrap().chain_id, 1);
        assert!(reg.get("nosuchnet").is_none());
        assert!(matches!(
            reg.require("nosuchnet"),
            Err(EscrowError::UnknownNetwork { .. })
        ));
    }

    #[test]
    fn test_classify_same_chain() {
        let reg = NetworkRegistry::builtin();
        assert_eq!(
            reg.classify("ethereum", "ethereum", None).unwrap(),
            TransferKind::SameChain
        );
        // Explicit native symbol is still a plain transfer
        let native = AssetRef {
            symbol: "ETH".to_string(),
            token_address: None,
        };
        assert_eq!(
            reg.classify("ethereum", "ethereum", Some(&native)).unwrap(),
            TransferKind::SameChain
        );
        assert_eq!(
            reg.classify("ethereum", "ethereum", Some(&token("USDC")))
                .unwrap(),
            TransferKind::SameChainSwap
        );
    }

    #[test]
    fn test_classify_cross_chain() {
        let reg = NetworkRegistry::builtin();
        // ETH native on both ethereum and arbitrum
        assert_eq!(
            reg.classify("ethereum", "arbitrum", None).unwrap(),
            TransferKind::CrossChainBridge
        );
        // Native assets differ
        assert_eq!(
            reg.classify("ethereum", "polygon", None).unwrap(),
            TransferKind::CrossChainSwapBridge
        );
        // Stablecoin deployed on both sides bridges as-is
        assert_eq!(
            reg.classify("ethereum", "polygon", Some(&token("USDC")))
                .unwrap(),
            TransferKind::CrossChainBridge
        );
    }

    #[test]
    fn test_classify_unknown_network() {
        let reg = NetworkRegistry::builtin();
        assert!(reg.classify("ethereum", "nosuchnet", None).is_err());
    }

    #[test]
    fn test_classify_is_deterministic() {
        let reg = NetworkRegistry::builtin();
        let a = reg.classify("ethereum", "polygon", Some(&token("USDC")));
        let b = reg.classify("ethereum", "polygon", Some(&token("USDC")));
        assert_eq!(a.unwrap(), b.unwrap());
    }
}
