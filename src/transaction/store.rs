//! Concurrent storage for in-flight transactions.
//!
//! Maps transaction keys to correlation handles, with separate typed views
//! for the client and server sides (the two sides derive keys differently
//! and must never shadow each other). The store interprets nothing: put
//! and remove are idempotent, and a repeated put replaces the existing
//! entry, which is what RFC 3261 state replacement relies on.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::transaction::client::ClientTxHandle;
use crate::transaction::key::TransactionKey;
use crate::transaction::server::ServerTxHandle;

/// Key → handle maps for both transaction sides, each behind its own
/// reader/writer lock. Guards are held only for the duration of a single
/// map operation and never across an await point.
#[derive(Debug, Default)]
pub(crate) struct TransactionStore {
    client: RwLock<HashMap<TransactionKey, ClientTxHandle>>,
    server: RwLock<HashMap<TransactionKey, ServerTxHandle>>,
}

impl TransactionStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_client(&self, key: TransactionKey, handle: ClientTxHandle) {
        self.client.write().expect("client map poisoned").insert(key, handle);
    }

    pub(crate) fn get_client(&self, key: &TransactionKey) -> Option<ClientTxHandle> {
        self.client.read().expect("client map poisoned").get(key).cloned()
    }

    pub(crate) fn remove_client(&self, key: &TransactionKey) {
        self.client.write().expect("client map poisoned").remove(key);
    }

    pub(crate) fn put_server(&self, key: TransactionKey, handle: ServerTxHandle) {
        self.server.write().expect("server map poisoned").insert(key, handle);
    }

    pub(crate) fn get_server(&self, key: &TransactionKey) -> Option<ServerTxHandle> {
        self.server.read().expect("server map poisoned").get(key).cloned()
    }

    pub(crate) fn remove_server(&self, key: &TransactionKey) {
        self.server.write().expect("server map poisoned").remove(key);
    }

    pub(crate) fn contains_client(&self, key: &TransactionKey) -> bool {
        self.client.read().expect("client map poisoned").contains_key(key)
    }

    pub(crate) fn contains_server(&self, key: &TransactionKey) -> bool {
        self.server.read().expect("server map poisoned").contains_key(key)
    }
}
