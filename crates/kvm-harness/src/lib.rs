//! # kvm-harness
//!
//! Host-side harness that runs an isolated test payload inside a KVM guest
//! and collects the verdict the guest leaves in shared memory.
//!
//! Components, each depending only on the ones before it:
//! - [`probe`]: device sanity check and supported CPUID leaves
//! - [`allocator`]: guarded guest memory slots
//! - [`instance`]: VM, vCPU and memory lifecycle
//! - [`engine`]: guest entry and exit handling
//! - [`result`]: the guest/host result protocol
//!
//! [`harness::Harness`] ties them together for a test runner. The
//! hypervisor is reached through the traits in [`traits`]; [`linux`]
//! provides the `/dev/kvm` backend.
//!
//! ## Example
//!
//! ```ignore
//! use kvm_harness::{Harness, TracingReporter, VmConfig, linux::KvmBackend};
//!
//! let payload = std::fs::read("guest.bin")?;
//! let mut harness = Harness::new(KvmBackend::new(), VmConfig::default(), payload);
//! harness.setup()?;
//! let results = harness.run(&mut TracingReporter)?;
//! harness.cleanup();
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// FFI bindings require extensive pointer casts.
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::borrow_as_ptr)]
// Documentation and style lints.
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub mod instance;
pub mod memory;
pub mod probe;
pub mod result;
pub mod traits;
pub mod types;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

pub use allocator::{GuardedBuffer, GuestMemoryMap};
pub use config::{VmConfig, VmConfigBuilder};
pub use engine::{ExitAction, classify, run_instance};
pub use error::{HarnessError, KvmError, KvmResult, Result};
pub use harness::{Harness, Reporter, TracingReporter};
pub use instance::VmInstance;
pub use memory::{Access, GuestAddress, MemoryRegion};
pub use probe::{FeatureCache, probe_device, supported_cpu_features};
pub use result::{Outcome, ResultRecord, Verdict, validate_result};
pub use traits::{Backend, HostMemoryInfo, HypervisorSystem, VcpuHandle, VmHandle};
pub use types::{CodeSegment, CpuFeatures, CpuidEntry, Registers, VcpuExit};
