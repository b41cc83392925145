//! Error types for pipeline orchestration

use crate::reader::ReaderError;
use crate::sink::SinkError;
use crate::stage::StageError;
use pixflow_broker::BrokerError;
use pixflow_common::Stage;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("writer failed: {0}")]
    Sink(#[from] SinkError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("{0} task panicked or was aborted")]
    Task(Stage),
}

impl PipelineError {
    /// Whether the run never got past validating its inputs
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Reader(
                ReaderError::Open { .. } | ReaderError::EmptyInput | ReaderError::InvalidFormat(_)
            )
        )
    }
}
