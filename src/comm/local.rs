//! Однопроцессный коммуникатор (P = 1): коллективы — тождественные,
//! point-to-point недостижим.

use anyhow::{bail, Result};

use super::Communicator;

#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl SelfComm {
    pub fn new() -> Self {
        SelfComm
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn send(&self, to: usize, tag: u32, _bytes: &[u8]) -> Result<()> {
        bail!("point-to-point send(to={}, tag={}) within a single-process communicator", to, tag);
    }

    fn recv(&self, from: usize, tag: u32) -> Result<Vec<u8>> {
        bail!("point-to-point recv(from={}, tag={}) within a single-process communicator", from, tag);
    }

    fn recv_any(&self, tag: u32) -> Result<(usize, Vec<u8>)> {
        bail!("point-to-point recv_any(tag={}) within a single-process communicator", tag);
    }
}
