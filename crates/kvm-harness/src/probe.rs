//! Capability probe: device sanity and supported CPU features.

use std::path::Path;
use std::sync::OnceLock;

use crate::{
    error::{HarnessError, Result},
    traits::{Backend, HypervisorSystem},
    types::CpuFeatures,
};

/// The only KVM API version ever released.
pub const KVM_API_VERSION: i32 = 12;

/// Initial capacity of the CPUID query buffer.
const CPUID_INITIAL_ENTRIES: u32 = 8;

/// Upper bound on the CPUID query buffer.
const CPUID_MAX_ENTRIES: u32 = 1 << 30;

/// Queries the CPUID leaves supported by the host.
///
/// Starts with room for 8 entries and doubles the buffer while the
/// hypervisor answers `E2BIG`. Returns `Ok(None)` if the host does not
/// support the query at all; that is not an error.
pub fn supported_cpu_features<S>(system: &S) -> Result<Option<CpuFeatures>>
where
    S: HypervisorSystem + ?Sized,
{
    let mut capacity = CPUID_INITIAL_ENTRIES;

    loop {
        match system.supported_cpuid(capacity) {
            Ok(features) => {
                tracing::debug!("Host supports {} CPUID leaves", features.len());
                return Ok(Some(features));
            }
            Err(e) if e.errno == libc::E2BIG && capacity < CPUID_MAX_ENTRIES => {
                capacity *= 2;
            }
            Err(e) => {
                tracing::debug!("KVM_GET_SUPPORTED_CPUID unavailable: {}", e);
                return Ok(None);
            }
        }
    }
}

/// Per-process cache of the supported CPU features.
///
/// Filled by the first successful query and never changed afterwards.
#[derive(Debug, Default)]
pub struct FeatureCache {
    cell: OnceLock<Option<CpuFeatures>>,
}

impl FeatureCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Returns the cached features, querying `system` on first use.
    pub fn get_or_probe<S>(&self, system: &S) -> Result<Option<&CpuFeatures>>
    where
        S: HypervisorSystem + ?Sized,
    {
        if let Some(features) = self.cell.get() {
            return Ok(features.as_ref());
        }

        let probed = supported_cpu_features(system)?;
        Ok(self.cell.get_or_init(|| probed).as_ref())
    }

    /// Returns the cached value without probing.
    #[must_use]
    pub fn get(&self) -> Option<Option<&CpuFeatures>> {
        self.cell.get().map(Option::as_ref)
    }
}

/// Opens the hypervisor device and checks the API version.
///
/// A missing device is `ResourceUnavailable`; an unexpected API version is
/// `Unsupported`, which a runner reports as "not applicable".
pub fn probe_device<B>(backend: &B, device: &Path) -> Result<B::System>
where
    B: Backend + ?Sized,
{
    let system = backend.open(device).map_err(|e| {
        HarnessError::resource(format!("failed to open {}: {}", device.display(), e))
    })?;

    let version = system.api_version().map_err(|e| {
        HarnessError::protocol(format!("KVM_GET_API_VERSION failed: {e}"))
    })?;

    if version != KVM_API_VERSION {
        return Err(HarnessError::Unsupported(format!(
            "KVM API version {version}, expected {KVM_API_VERSION}"
        )));
    }

    tracing::info!("Opened {} (KVM API version {})", device.display(), version);
    Ok(system)
}
