pub mod abi;
pub mod logs;
