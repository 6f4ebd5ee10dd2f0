/// Native module contains the OS-facing implementations of core traits:
/// memory samplers reading procfs or `ps`, and a compiler that runs build
/// commands as supervised processes.
pub mod compiler;
pub mod sampler;
