//! Setup / run / cleanup entry points for a test runner.

use crate::{
    config::VmConfig,
    engine::run_instance,
    error::{HarnessError, Result},
    instance::VmInstance,
    probe::FeatureCache,
    result::Verdict,
    traits::{Backend, HypervisorSystem},
};

pub use crate::result::validate_result;

/// Name reported when the guest's file name cannot be read.
pub const UNKNOWN_FILE: &str = "<unknown>";

/// Receives every verdict the guest reports.
pub trait Reporter {
    /// Reports one result. `file` and `verdict.aux` locate the guest source.
    fn report(&mut self, verdict: &Verdict, file: &str, message: &str);
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, verdict: &Verdict, file: &str, message: &str) {
        use crate::result::Outcome;

        match verdict.outcome {
            Outcome::Pass | Outcome::Info | Outcome::Conf => {
                tracing::info!("{}:{}: {}: {}", file, verdict.aux, verdict.outcome, message);
            }
            Outcome::Warn => {
                tracing::warn!("{}:{}: {}: {}", file, verdict.aux, verdict.outcome, message);
            }
            Outcome::Fail | Outcome::Broken => {
                tracing::error!("{}:{}: {}: {}", file, verdict.aux, verdict.outcome, message);
            }
        }
    }
}

/// Runs one payload in one VM.
pub struct Harness<B: Backend> {
    backend: B,
    config: VmConfig,
    payload: Vec<u8>,
    features: FeatureCache,
    instance: Option<VmInstance<<B::System as HypervisorSystem>::Vm>>,
}

impl<B: Backend> Harness<B> {
    /// Creates a harness; nothing is opened until [`Harness::setup`].
    pub fn new(backend: B, config: VmConfig, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            backend,
            config,
            payload: payload.into(),
            features: FeatureCache::new(),
            instance: None,
        }
    }

    /// Builds the VM instance. A second call is a no-op.
    pub fn setup(&mut self) -> Result<()> {
        if self.instance.is_some() {
            return Ok(());
        }

        let instance = VmInstance::create_with_cache(
            &self.backend,
            &self.config,
            &self.payload,
            &self.features,
        )?;
        self.instance = Some(instance);
        Ok(())
    }

    /// Runs the guest until it signals that it is done, reporting every
    /// result on the way. Returns the number of results reported.
    pub fn run<R: Reporter + ?Sized>(&mut self, reporter: &mut R) -> Result<usize> {
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| HarnessError::invalid_config("run called before setup"))?;

        let mut reported = 0;
        loop {
            let record = run_instance(instance)?;
            if record.is_exit() {
                break;
            }

            let verdict = record.verdict()?;
            let file = instance
                .guest_str(record.file_addr)
                .unwrap_or_else(|| UNKNOWN_FILE.to_string());
            reporter.report(&verdict, &file, &record.message);
            reported += 1;
        }

        tracing::debug!("Guest finished after {} results", reported);
        Ok(reported)
    }

    /// Destroys the instance. Safe to call at any time, any number of times.
    pub fn cleanup(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            instance.destroy();
        }
    }

    /// Returns the live instance, if set up.
    pub fn instance(&self) -> Option<&VmInstance<<B::System as HypervisorSystem>::Vm>> {
        self.instance.as_ref()
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: Backend> Drop for Harness<B> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
