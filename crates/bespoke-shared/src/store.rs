//! The Result Store contract (§4.6): atomic write, atomic compare-and-set,
//! range scan by key prefix, durable across restart. Keys are namespaced
//! `sub/<id>`, `task/<id>`, `cache/<fingerprint>`, `lease/<fingerprint>`,
//! `queue/<routing-key>/…` (§6.3).

use async_trait::async_trait;

use crate::error::ExecutorResult;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Unconditionally write `value` at `key`, durable on return.
    async fn put(&self, key: &str, value: &[u8]) -> ExecutorResult<()>;

    async fn get(&self, key: &str) -> ExecutorResult<Option<Vec<u8>>>;

    /// Write `value` at `key` only if the key's current contents equal
    /// `expected` (`None` means "key must not exist"). Returns `true` if
    /// the write took effect.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> ExecutorResult<bool>;

    async fn delete(&self, key: &str) -> ExecutorResult<()>;

    /// All keys sharing `prefix`, in no particular order.
    async fn scan_prefix(&self, prefix: &str) -> ExecutorResult<Vec<String>>;

    /// Atomically allocate the next value of a named integer sequence,
    /// used for the client-visible submission id (§3 "monotonically
    /// assigned integer identifier").
    async fn next_sequence(&self, name: &str) -> ExecutorResult<u64>;
}
