//! Inbound ports (driving side - API)

use crate::domain::WitnessIndex;
use crate::error::Result;
use crate::work::WorkKind;

/// Primary port: block production by local witnesses
pub trait WitnessProducer: Send + Sync {
    /// Spawn one production thread per configured identity
    fn start(&self) -> Result<()>;

    /// Stop and join every production thread
    fn shutdown(&self);

    /// Signal that new blocks or transactions are available
    fn notify_new_work(&self, kind: WorkKind);

    /// Snapshot of every production thread
    fn status(&self) -> Vec<WitnessStatus>;
}

/// Phase of a production thread
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProducerState {
    /// Not started, or waiting for the ledger
    #[default]
    Idle,
    /// Choosing the block to build on
    ScoringPrior,
    /// Collecting transactions
    Building,
    /// Waiting for new work or the production window
    WaitingForWork,
    /// Hashing and signing the block
    Finalizing,
    /// Thread has exited
    Stopped,
}

/// Status of one production thread
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WitnessStatus {
    /// Witness index acted as, `None` once deactivated
    pub index: Option<WitnessIndex>,
    /// Current phase
    pub state: ProducerState,
    /// Blocks produced by this thread
    pub blocks_produced: u64,
    /// Failed attempts since the last success
    pub consecutive_failures: u32,
    /// Level of the last block produced
    pub last_level: Option<u64>,
}
