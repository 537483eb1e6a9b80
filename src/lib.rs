pub mod alloc;
pub mod btree;
pub mod catalog;
pub mod cnode;
pub mod config;
pub mod error;
pub mod state;
pub mod vnops;
pub mod volume;
