//! A flash translation layer for raw NAND.
//!
//! Raw NAND only erases whole blocks, programs pages in order within a
//! block, and grows bad blocks over time. This crate turns that into a
//! small logical sector space that can be read, written, trimmed and synced,
//! and that survives power loss at any instant:
//!
//! - [`journal::Journal`] drives the chip as an append-only queue of pages
//!   with periodic checkpoints and automatic bad-block relocation;
//! - [`map::Map`] builds a persistent sector index on top by storing radix
//!   tree nodes inline in the journal's metadata slots.
//!
//! The NAND itself is abstracted behind the [`nand::Nand`] trait. A
//! fault-injecting in-memory simulator ([`nand::sim::SimNand`]) ships with
//! the crate, along with a Linux MTD backend on that platform.
//!
//! ```no_run
//! use nandmap::{journal::Config, map::Map, nand::sim::SimNand};
//!
//! let mut nand = SimNand::new("113x8x512".parse().unwrap());
//! let mut map = Map::new(&mut nand, Config::default());
//! let _ = map.resume(); // a blank chip resumes empty
//!
//! let data = vec![0u8; 512];
//! map.write(17, &data).unwrap();
//! map.sync().unwrap();
//! ```

pub mod error;
pub mod journal;
pub mod map;
pub mod nand;

pub use error::{Error, Result};
pub use journal::{Config, Journal};
pub use map::{Map, SectorIndex, SECTOR_NONE};
pub use nand::{BlockIndex, Nand, NandLayout, PageIndex, PAGE_NONE};
