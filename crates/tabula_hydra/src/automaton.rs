use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tabula_common::TabulaResult;

/// Deterministic state machine replicated by a [`crate::Cell`].
///
/// Every peer applies the same mutations in the same order, so `apply` must
/// depend only on the automaton state, the mutation and its log index.
pub trait Automaton: Send + Sync + 'static {
    type Mutation: Serialize + DeserializeOwned + Clone + Debug + Send + Sync;
    type Response: Send;

    /// Leader-side admission check, run before the mutation is logged.
    fn validate(&self, _mutation: &Self::Mutation) -> TabulaResult<()> {
        Ok(())
    }

    fn apply(&mut self, index: u64, mutation: &Self::Mutation) -> TabulaResult<Self::Response>;

    fn save_snapshot(&self) -> TabulaResult<Vec<u8>>;

    fn load_snapshot(&mut self, data: &[u8]) -> TabulaResult<()>;
}
