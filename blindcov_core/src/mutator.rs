use crate::cancel::CancelToken;
use crate::config::{SearchTunables, TargetDescriptor, shell_path};
use crate::corpus::{CorpusError, CorpusPool};
use crate::executor::{CommandExecutor, CommandExecutorConfig, ExecutionStatus};
use crate::state::{SharedState, lock_shared};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Upper bound used when no `max-mutation-size` is configured; the actual
/// size is drawn once from `1..=DEFAULT_MAX_MUTATION_SIZE`.
pub const DEFAULT_MAX_MUTATION_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStrategy {
    /// Random bytes at a random offset past the header.
    Internal,
    /// A chunk lifted from a corpus file.
    Splice,
    /// Deterministic single-byte sweep.
    Iterative,
    /// Whole buffer rewritten by an external mutator such as radamsa.
    External,
}

impl MutationStrategy {
    /// Order matches `strategy-weights`.
    pub const ALL: [MutationStrategy; 4] = [
        MutationStrategy::Internal,
        MutationStrategy::Splice,
        MutationStrategy::Iterative,
        MutationStrategy::External,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MutationStrategy::Internal => "internal",
            MutationStrategy::Splice => "splice",
            MutationStrategy::Iterative => "iterative",
            MutationStrategy::External => "external",
        }
    }
}

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("No corpus directory configured for splice mutations")]
    NoCorpus,
    #[error("Corpus unavailable for splicing: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Mutation scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("External mutator '{program}' failed: {detail}")]
    External { program: String, detail: String },
}

/// One proposed change to the template, with enough provenance to write a
/// diff record or remember it as discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub offset: usize,
    pub size: usize,
    pub payload: Vec<u8>,
    /// Full candidate buffer handed to the target.
    pub data: Vec<u8>,
    pub strategy: MutationStrategy,
}

impl Candidate {
    /// `template` with `payload` written at `offset`. The offset is clamped to
    /// the template length and the buffer grows when the payload runs past
    /// its end.
    pub fn patch(template: &[u8], offset: usize, payload: Vec<u8>, strategy: MutationStrategy) -> Self {
        let mut data = template.to_vec();
        let offset = offset.min(data.len());
        let end = offset + payload.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(&payload);
        Self {
            offset,
            size: payload.len(),
            payload,
            data,
            strategy,
        }
    }

    pub fn discard_record(&self) -> DiscardRecord {
        DiscardRecord {
            offset: self.offset,
            size: self.size,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscardRecord {
    pub offset: usize,
    pub size: usize,
    pub payload: Vec<u8>,
}

/// Mutations already measured as unproductive.
#[derive(Debug, Default)]
pub struct DiscardSet {
    records: HashSet<DiscardRecord>,
}

impl DiscardSet {
    pub fn insert(&mut self, record: DiscardRecord) -> bool {
        self.records.insert(record)
    }

    pub fn contains(&self, record: &DiscardRecord) -> bool {
        self.records.contains(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Position of the iterative sweep: which byte, and which value to try next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationCursor {
    pub iteration: usize,
    pub iteration_char: u8,
}

impl IterationCursor {
    /// Moves to the next value, rolling to the next byte after 255.
    fn advance(&mut self) {
        if self.iteration_char == u8::MAX {
            self.iteration_char = 0;
            self.iteration += 1;
            log::info!("Current iteration {}", self.iteration);
        } else {
            self.iteration_char += 1;
        }
    }

    /// Abandons the current byte, used once a value there was accepted.
    pub fn next_position(&mut self) {
        self.iteration_char = 0;
        self.iteration += 1;
    }
}

/// Per-iteration knobs, resolved from the freshly loaded tunables.
#[derive(Debug, Clone)]
pub struct MutationParams {
    pub max_size: usize,
    pub skip_bytes: usize,
    pub max_retries: usize,
    pub external_mutator: String,
    /// Kill deadline for the external mutator.
    pub timeout: Duration,
}

impl MutationParams {
    pub fn from_descriptor(descriptor: &TargetDescriptor, fallback_max_size: usize) -> Self {
        let tunables = &descriptor.tunables;
        Self {
            max_size: tunables.max_mutation_size.unwrap_or(fallback_max_size),
            skip_bytes: tunables.skip_bytes,
            max_retries: tunables.max_mutation_retries.max(1),
            external_mutator: tunables.external_mutator.clone(),
            timeout: descriptor.timeout,
        }
    }
}

/// Produces candidates from the live template.
pub struct MutationEngine {
    rng: ChaCha8Rng,
    cancel: CancelToken,
}

impl MutationEngine {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            rng,
            cancel: CancelToken::new(),
        }
    }

    /// Lets `cancel` kill a running external mutator.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Forced strategy when `iterative` or `radamsa` is set, otherwise a
    /// weighted draw. Splice is never drawn without a corpus.
    pub fn choose_strategy(&mut self, tunables: &SearchTunables, corpus_available: bool) -> MutationStrategy {
        if tunables.iterative {
            return MutationStrategy::Iterative;
        }
        if tunables.external {
            return MutationStrategy::External;
        }
        let mut weights = tunables.strategy_weights;
        if !corpus_available {
            weights[1] = 0;
        }
        match WeightedIndex::new(weights) {
            Ok(dist) => MutationStrategy::ALL[dist.sample(&mut self.rng)],
            Err(_) => MutationStrategy::Internal,
        }
    }

    pub fn mutate(
        &mut self,
        strategy: MutationStrategy,
        template: &[u8],
        params: &MutationParams,
        shared: &Mutex<SharedState>,
        corpus: Option<&CorpusPool>,
    ) -> Result<Candidate, MutationError> {
        match strategy {
            MutationStrategy::Internal => Ok(self.mutate_internal(template, params, shared)),
            MutationStrategy::Splice => {
                let corpus = corpus.ok_or(MutationError::NoCorpus)?;
                self.mutate_splice(template, params, corpus)
            }
            MutationStrategy::Iterative => Ok(mutate_iterative(template, params, shared)),
            MutationStrategy::External => mutate_external(template, params, &self.cancel),
        }
    }

    fn random_offset(&mut self, len: usize, size: usize, skip: usize) -> usize {
        if len >= size && len - size > skip {
            self.rng.random_range(skip..=len - size)
        } else {
            skip
        }
    }

    fn mutate_internal(
        &mut self,
        template: &[u8],
        params: &MutationParams,
        shared: &Mutex<SharedState>,
    ) -> Candidate {
        let state = lock_shared(shared);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let size = self.rng.random_range(0..=params.max_size);
            let offset = self.random_offset(template.len(), size, params.skip_bytes);
            let mut payload = vec![0u8; size];
            self.rng.fill(&mut payload[..]);

            let candidate = Candidate::patch(template, offset, payload, MutationStrategy::Internal);
            let unchanged = template.get(offset..offset + size) == Some(&candidate.payload[..]);
            let discarded = state.discards.contains(&candidate.discard_record());
            if !unchanged && !discarded {
                return candidate;
            }
            if attempt >= params.max_retries {
                log::debug!(
                    "No fresh mutation after {attempt} attempts, accepting a known one at 0x{offset:x}"
                );
                return candidate;
            }
            log::trace!("Generated a mutated block with already discarded data...");
        }
    }

    fn mutate_splice(
        &mut self,
        template: &[u8],
        params: &MutationParams,
        corpus: &CorpusPool,
    ) -> Result<Candidate, MutationError> {
        let source = corpus.random_entry(&mut self.rng)?;
        let buf = source.data;
        let size = self.rng.random_range(0..=params.max_size);
        let offset = self.random_offset(buf.len().min(template.len()), size, params.skip_bytes);
        let start = offset.min(buf.len());
        let chunk = buf[start..(start + size).min(buf.len())].to_vec();

        // Coin flip: keep the donor's offset or drop the chunk somewhere else.
        let mut at = offset;
        if self.rng.random_bool(0.5) && template.len() > chunk.len() {
            at = self.random_offset(template.len(), chunk.len(), params.skip_bytes);
        }
        Ok(Candidate::patch(template, at, chunk, MutationStrategy::Splice))
    }
}

fn mutate_iterative(template: &[u8], params: &MutationParams, shared: &Mutex<SharedState>) -> Candidate {
    let mut state = lock_shared(shared);
    let cursor = state.cursor;
    state.cursor.advance();
    drop(state);

    if template.is_empty() {
        return Candidate::patch(template, 0, vec![cursor.iteration_char], MutationStrategy::Iterative);
    }
    let position = (params.skip_bytes + cursor.iteration) % template.len();
    Candidate::patch(
        template,
        position,
        vec![cursor.iteration_char],
        MutationStrategy::Iterative,
    )
}

fn mutate_external(
    template: &[u8],
    params: &MutationParams,
    cancel: &CancelToken,
) -> Result<Candidate, MutationError> {
    let program = params.external_mutator.trim();
    if program.is_empty() {
        return Err(MutationError::External {
            program: String::new(),
            detail: "empty external mutator command".to_string(),
        });
    }
    let failed = |detail: String| MutationError::External {
        program: program.to_string(),
        detail,
    };

    // Both removed when dropped, including on the error paths below.
    let mut scratch = tempfile::Builder::new().prefix("bcf-ext").tempfile()?;
    scratch.write_all(template)?;
    scratch.flush()?;
    let output = tempfile::Builder::new().prefix("bcf-ext-out").tempfile()?;

    let config = CommandExecutorConfig {
        stdout_file: Some(output.path().to_path_buf()),
        ..CommandExecutorConfig::new(
            format!("{program} {}", shell_path(scratch.path())),
            params.timeout,
        )
    };
    let status = CommandExecutor::new(config)
        .with_cancel(cancel.clone())
        .run()
        .map_err(|e| failed(e.to_string()))?;
    match status {
        ExecutionStatus::Exited(0) => {}
        ExecutionStatus::Exited(code) => return Err(failed(format!("exited with {code}"))),
        ExecutionStatus::Timeout => return Err(failed("timed out".to_string())),
        ExecutionStatus::Cancelled => return Err(failed("cancelled".to_string())),
    }

    let data = std::fs::read(output.path())?;
    Ok(Candidate {
        offset: 0,
        size: data.len(),
        payload: data.clone(),
        data,
        strategy: MutationStrategy::External,
    })
}
