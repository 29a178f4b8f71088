use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use knc_wire_spec::CORE_STATUS_OK;

use crate::codec::CoreAddress;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CoreInfo {
    pub asic: u8,
    pub index: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CoreMap {
    cores: Vec<CoreInfo>,
    by_asic: BTreeMap<u8, Vec<CoreId>>,
}

impl CoreMap {
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn enabled(&self) -> usize {
        self.cores.iter().filter(|core| core.enabled).count()
    }

    pub fn get(&self, id: CoreId) -> Option<&CoreInfo> {
        self.cores.get(id.0)
    }

    pub fn asics(&self) -> impl Iterator<Item = u8> + '_ {
        self.by_asic.keys().copied()
    }

    /// Finds the asic's first registered core and steps `address.core`
    /// positions forward among that asic's cores.
    pub fn resolve(&self, address: CoreAddress) -> Option<CoreId> {
        let cores = self.by_asic.get(&address.asic)?;
        let offset = usize::try_from(address.core).ok()?;
        cores.get(offset).copied()
    }

    pub fn label(&self, id: CoreId) -> String {
        match self.get(id) {
            Some(core) => format!("asic{}/{}", core.asic, core.index),
            None => id.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CoreMapBuilder {
    map: CoreMap,
}

impl CoreMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_board(&mut self, asic: u8, statuses: &[u8]) -> Result<()> {
        if self.map.by_asic.contains_key(&asic) {
            bail!("asic {asic} registered twice");
        }
        let mut ids = Vec::with_capacity(statuses.len());
        for (index, status) in statuses.iter().enumerate() {
            let id = CoreId(self.map.cores.len());
            self.map.cores.push(CoreInfo {
                asic,
                index: index as u32,
                enabled: *status == CORE_STATUS_OK,
            });
            ids.push(id);
        }
        self.map.by_asic.insert(asic, ids);
        Ok(())
    }

    pub fn boards(&self) -> usize {
        self.map.by_asic.len()
    }

    pub fn build(self) -> CoreMap {
        self.map
    }
}
