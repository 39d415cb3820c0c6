//! Wallet capability and the identity provider built on it.
//!
//! The core never branches on [`WalletKind`]; it only needs an address and a
//! way to disconnect. Browser/extension integrations implement
//! [`WalletProvider`] outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ChatError;
use crate::identity::{canonicalize, Identity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    MetaMask,
    Phantom,
    Keplr,
    Core,
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WalletKind::MetaMask => "metamask",
            WalletKind::Phantom => "phantom",
            WalletKind::Keplr => "keplr",
            WalletKind::Core => "core",
        })
    }
}

/// A connected wallet.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn kind(&self) -> WalletKind;

    /// Account address as reported by the wallet, not canonicalised.
    fn address(&self) -> &str;

    /// EVM chain id. `None` for wallets without a numeric chain.
    fn chain_id(&self) -> Option<u64>;

    async fn disconnect(&self) -> Result<(), ChatError>;
}

/// Source of "who am I" for the messaging core.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;

    /// Receiver that observes every identity change, including disconnects.
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}

/// Wallet with a fixed address. Used by headless deployments and tests.
#[derive(Debug)]
pub struct StaticWallet {
    kind: WalletKind,
    address: String,
    chain_id: Option<u64>,
    connected: AtomicBool,
}

impl StaticWallet {
    pub fn new(kind: WalletKind, address: impl Into<String>, chain_id: Option<u64>) -> Self {
        Self {
            kind,
            address: address.into(),
            chain_id,
            connected: AtomicBool::new(true),
        }
    }

    pub fn metamask(address: impl Into<String>, chain_id: u64) -> Self {
        Self::new(WalletKind::MetaMask, address, Some(chain_id))
    }

    pub fn core(address: impl Into<String>, chain_id: u64) -> Self {
        Self::new(WalletKind::Core, address, Some(chain_id))
    }

    pub fn phantom(address: impl Into<String>) -> Self {
        Self::new(WalletKind::Phantom, address, None)
    }

    pub fn keplr(address: impl Into<String>) -> Self {
        Self::new(WalletKind::Keplr, address, None)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletProvider for StaticWallet {
    fn kind(&self) -> WalletKind {
        self.kind
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    async fn disconnect(&self) -> Result<(), ChatError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// [`IdentityProvider`] backed by at most one connected wallet.
pub struct WalletIdentityProvider {
    wallet: Mutex<Option<Arc<dyn WalletProvider>>>,
    identity: watch::Sender<Option<Identity>>,
}

impl Default for WalletIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletIdentityProvider {
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            wallet: Mutex::new(None),
            identity,
        }
    }

    /// Adopt `wallet` as the current identity, disconnecting any previous one.
    pub async fn connect(&self, wallet: Arc<dyn WalletProvider>) -> Result<Identity, ChatError> {
        let identity = canonicalize(wallet.address());
        let previous = self.wallet.lock().replace(Arc::clone(&wallet));
        if let Some(previous) = previous {
            previous.disconnect().await?;
        }

        tracing::info!(
            wallet = %wallet.kind(),
            identity = %identity,
            chain_id = ?wallet.chain_id(),
            "wallet connected"
        );
        self.identity.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    pub async fn disconnect(&self) -> Result<(), ChatError> {
        let wallet = self.wallet.lock().take();
        if let Some(wallet) = wallet {
            wallet.disconnect().await?;
            tracing::info!(wallet = %wallet.kind(), "wallet disconnected");
        }
        self.identity.send_replace(None);
        Ok(())
    }

    pub fn wallet(&self) -> Option<Arc<dyn WalletProvider>> {
        self.wallet.lock().clone()
    }
}

impl IdentityProvider for WalletIdentityProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }
}
