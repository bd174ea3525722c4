mod mem_ensemble;
mod mem_session;

pub use mem_ensemble::*;
pub use mem_session::*;

#[cfg(test)]
mod mem_session_test;
