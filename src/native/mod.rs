/// Native module contains implementations of core traits
/// without any container runtime, using rlimits, process groups
/// and syscalls directly instead.
pub mod interactive;
pub mod process;
pub mod sandbox;
