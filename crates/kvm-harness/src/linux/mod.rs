//! Linux KVM backend.
//!
//! Talks to `/dev/kvm` through raw ioctls. Only x86_64 hosts are supported.

pub(crate) mod ffi;
mod system;
mod vcpu;
mod vm;

pub use system::{KvmBackend, KvmSystem};
pub use vcpu::KvmVcpu;
pub use vm::KvmVm;
