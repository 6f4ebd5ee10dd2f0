pub mod classify;
pub mod domain;
pub mod pipeline;
pub mod runnable;
pub mod traits;
