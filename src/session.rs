use std::collections::BTreeSet;

use crate::assembler::{AssemblerStatus, ChunkAssembler};
use crate::config::PipelineConfig;
use crate::param::{self, Blob, ParameterDescriptor};
use crate::progress::Progress;
use crate::Result;

#[derive(Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// The current parameter still expects bytes.
    Receiving,
    /// A parameter completed and more parameters follow.
    ParameterReady(Blob),
    /// The last parameter completed; carries its blob.
    AllComplete(Blob),
    /// Too many bytes, or bytes after completion or failure. Fatal for the
    /// session, never retried.
    ProtocolError,
}

/// Receive side of one upload: validates the declared parameters, feeds
/// chunks to one [`ChunkAssembler`] per parameter in order, and accounts
/// for receive progress.
///
/// Each parameter weighs `1 / paramCount` of the receive phase, which
/// itself is worth `receive_weight` of the whole task, so the receive
/// progress ends at exactly `receive_weight`.
#[derive(Debug)]
pub struct UploadSession {
    params: Vec<ParameterDescriptor>,
    current_index: usize,
    assembler: Option<ChunkAssembler>,
    received_for_current: u64,
    total_declared: u64,
    total_received: u64,
    receive_weight: f64,
    progress: Option<Progress>,
    failed: bool,
}

impl UploadSession {
    /// Validate `params` against `supported_types` and start receiving the
    /// first parameter. Nothing is allocated for bytes when validation fails.
    pub fn begin(
        params: Vec<ParameterDescriptor>,
        supported_types: &BTreeSet<String>,
    ) -> Result<Self> {
        let total_declared = param::validate(&params, supported_types, None)?;
        Ok(Self::with_total(params, total_declared, 1.0))
    }

    /// Same as [`UploadSession::begin`], with the declared-size limit and
    /// receive weight taken from `config`.
    pub fn begin_with(
        params: Vec<ParameterDescriptor>,
        supported_types: &BTreeSet<String>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let total_declared = param::validate(
            &params,
            supported_types,
            config.max_declared_bytes,
        )?;
        Ok(Self::with_total(
            params,
            total_declared,
            config.receive_weight,
        ))
    }

    fn with_total(
        params: Vec<ParameterDescriptor>,
        total_declared: u64,
        receive_weight: f64,
    ) -> Self {
        let assembler = params.first().map(ChunkAssembler::new);
        Self {
            params,
            current_index: 0,
            assembler,
            received_for_current: 0,
            total_declared,
            total_received: 0,
            receive_weight,
            progress: None,
            failed: false,
        }
    }

    /// Report receive progress increments into `progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_receive_weight(mut self, receive_weight: f64) -> Self {
        self.receive_weight = receive_weight.clamp(0.0, 1.0);
        self
    }

    pub fn append_chunk(&mut self, bytes: &[u8]) -> SessionStatus {
        if self.failed {
            return SessionStatus::ProtocolError;
        }
        let (name, status) = match self.assembler.as_mut() {
            Some(assembler) => (
                self.params[self.current_index]
                    .display_name()
                    .to_owned(),
                assembler.append_chunk(bytes),
            ),
            None => {
                log::warn!(
                    "session: {} bytes received, no more files expected",
                    bytes.len()
                );
                return SessionStatus::ProtocolError;
            }
        };

        let before = self.receive_progress();
        let status = match status {
            AssemblerStatus::Overflow => {
                log::warn!(
                    "session: {} bytes overflow param {} ({})",
                    bytes.len(),
                    self.current_index,
                    name
                );
                self.fail();
                return SessionStatus::ProtocolError;
            }
            AssemblerStatus::Incomplete => {
                self.account(bytes.len());
                SessionStatus::Receiving
            }
            AssemblerStatus::Completed(blob) => {
                self.account(bytes.len());
                self.current_index += 1;
                self.received_for_current = 0;
                self.assembler = self
                    .params
                    .get(self.current_index)
                    .map(ChunkAssembler::new);
                log::debug!(
                    "session: param {} of {} ({}) complete",
                    self.current_index,
                    self.params.len(),
                    blob.name
                );
                if self.assembler.is_some() {
                    SessionStatus::ParameterReady(blob)
                } else {
                    SessionStatus::AllComplete(blob)
                }
            }
        };

        if let Some(progress) = &self.progress {
            let after = self.receive_progress();
            progress.increment(
                &format!("Receiving {} ...", name),
                after - before,
            );
        }
        status
    }

    /// Mark the session as failed; any further chunk is a protocol error.
    pub fn fail(&mut self) {
        self.failed = true;
        self.assembler = None;
    }

    /// Receive progress in `[0, receive_weight]`, non-decreasing.
    pub fn receive_progress(&self) -> f64 {
        let count = self.params.len() as f64;
        let mut completed = self.current_index as f64;
        if let Some(param) = self.params.get(self.current_index) {
            completed += self.received_for_current as f64 / param.size as f64;
        }
        self.receive_weight * (completed / count)
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.params.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ParameterDescriptor] {
        &self.params
    }

    pub fn received_bytes_for_current(&self) -> u64 {
        self.received_for_current
    }

    pub fn total_declared_bytes(&self) -> u64 {
        self.total_declared
    }

    pub fn total_received_bytes(&self) -> u64 {
        self.total_received
    }

    fn account(&mut self, len: usize) {
        self.received_for_current += len as u64;
        self.total_received += len as u64;
    }
}
