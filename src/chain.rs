//! Sequential signing chains.
//!
//! Every step of a [`SigningChain`] signs the document produced by the step
//! before it (or the chain source, for the first step) and writes the result
//! to its own destination. A failing step aborts its chain; files already
//! produced stay on disk.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::{
    sign, verify_append, CertificationLevel, Error, Pkcs7Signer, SignRequest, SigningConfig,
};

/// Broad classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The credential store could not provide a usable identity.
    Credential,
    Io,
    /// The document forbids the requested signature.
    PolicyViolation,
    /// Malformed or unexpected document content.
    Document,
}

impl FailureKind {
    /// Classifies an error by the first recognized cause in its chain.
    pub fn of(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(e) = cause.downcast_ref::<Error>() {
                return e.kind();
            }
            if cause.is::<std::io::Error>() {
                return FailureKind::Io;
            }
        }
        FailureKind::Document
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Credential => "credential error",
            FailureKind::Io => "I/O error",
            FailureKind::PolicyViolation => "policy violation",
            FailureKind::Document => "malformed document",
        })
    }
}

pub struct SigningStep<'a> {
    pub signer: &'a (dyn Pkcs7Signer + Sync),
    pub field_name: String,
    pub certification: CertificationLevel,
    pub dest: PathBuf,
}

pub struct SigningChain<'a> {
    /// Used to tell chains apart in logs and errors.
    pub name: String,
    pub source: PathBuf,
    pub steps: Vec<SigningStep<'a>>,
}

/// A failed step, with enough context to tell which one broke the chain.
#[derive(Debug)]
pub struct StepError {
    pub chain: String,
    /// Zero based index of the failing step.
    pub step: usize,
    pub signer: String,
    pub field: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub kind: FailureKind,
    pub cause: anyhow::Error,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain {:?}, step {} ({} signing field {:?}, {} -> {}): {}: {:#}",
            self.chain,
            self.step,
            self.signer,
            self.field,
            self.source_path.display(),
            self.dest_path.display(),
            self.kind,
            self.cause
        )
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

/// Runs signing chains with one run-scoped configuration.
pub struct Orchestrator {
    config: SigningConfig,
}

impl Orchestrator {
    pub fn new(config: SigningConfig) -> Self {
        Self { config }
    }

    /// Runs the steps of `chain` in order and returns the produced files.
    pub fn run(&self, chain: &SigningChain) -> Result<Vec<PathBuf>, StepError> {
        let mut produced = Vec::with_capacity(chain.steps.len());
        let mut source = chain.source.as_path();

        for (idx, step) in chain.steps.iter().enumerate() {
            log::info!(
                "[{}] step {idx}: {} signs {:?} ({:?}) into {}",
                chain.name,
                step.signer.signer_name(),
                step.field_name,
                step.certification,
                step.dest.display()
            );

            self.run_step(source, step).map_err(|cause| StepError {
                chain: chain.name.clone(),
                step: idx,
                signer: step.signer.signer_name().to_owned(),
                field: step.field_name.clone(),
                source_path: source.to_owned(),
                dest_path: step.dest.clone(),
                kind: FailureKind::of(&cause),
                cause,
            })?;

            produced.push(step.dest.clone());
            source = step.dest.as_path();
        }

        log::info!("[{}] done, {} file(s) produced", chain.name, produced.len());
        Ok(produced)
    }

    /// Runs independent chains on separate threads. Results are in the order
    /// of `chains`; a failure only stops its own chain.
    pub fn run_all(&self, chains: &[SigningChain]) -> Vec<Result<Vec<PathBuf>, StepError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = chains
                .iter()
                .map(|chain| scope.spawn(move || self.run(chain)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }

    fn run_step(&self, source: &Path, step: &SigningStep) -> anyhow::Result<()> {
        let input =
            fs::read(source).with_context(|| format!("reading {}", source.display()))?;

        let request = SignRequest::new(&step.field_name, step.certification, &self.config);
        let output = sign(&input, &request, &step.signer)?;

        if let Some(dir) = step.dest.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        fs::write(&step.dest, &output)
            .with_context(|| format!("writing {}", step.dest.display()))?;

        if self.config.verify_each_step {
            verify_append(&input, &output)
                .with_context(|| format!("verifying {}", step.dest.display()))?;
        }

        Ok(())
    }
}
