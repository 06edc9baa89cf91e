// Contracts Module - Read-only ABIs

pub mod erc20;
pub mod lending_pool;
pub mod pool_register;

// Public exports
pub use erc20::Erc20;
pub use lending_pool::LendingPool;
pub use pool_register::PoolRegister;
