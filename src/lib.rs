//! ephys-recorder: recording data path for multi-stream electrophysiology
//!
//! Acquisition hands each processing block to a [`record::RecordNode`],
//! which copies samples into lock-free ring buffers, feeds sync pulses to
//! the [`sync::Synchronizer`] and lets a background record thread drain
//! everything into the Open Ephys binary format.

pub mod common;
pub mod config;
pub mod emulator;
pub mod format;
pub mod queue;
pub mod record;
pub mod sync;
