pub mod compiler;
pub mod sampler;
