use num_traits::FromPrimitive;
use serde::de::Error;
use serde::{Deserialize, Deserializer};

use crate::base::config::Config;
use crate::rsc::types::TcsType;

/// A group type written by name or by its numeric cell value.
#[derive(Deserialize)]
#[serde(untagged)]
enum TypeCell {
    Name(TcsType),
    Cell(u32),
}

fn tcs_type_cell<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TcsType, D::Error> {
    match TypeCell::deserialize(deserializer)? {
        TypeCell::Name(ty) => Ok(ty),
        TypeCell::Cell(cell) => TcsType::from_u32(cell)
            .ok_or_else(|| D::Error::custom(format!("unknown TCS type {}", cell))),
    }
}

/// How many TCSes of one type a DRV is given.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TcsGroupConfig {
    #[serde(rename = "type", deserialize_with = "tcs_type_cell")]
    pub ty: TcsType,
    pub count: usize,
}

impl TcsGroupConfig {
    pub const fn new(ty: TcsType, count: usize) -> Self {
        Self { ty, count }
    }
}

/// One RSC DRV, as described by the platform.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RscConfig {
    pub name: String,
    /// Selects this DRV's field in DRV_PRNT_CHLD_CONFIG.
    pub drv_id: u32,
    /// Offset of the TCS window from the DRV base.
    pub tcs_offset: usize,
    /// One entry per TCS type; groups are laid out in this order.
    pub tcs_config: Vec<TcsGroupConfig>,
    /// Accept every write and flush without touching hardware.
    pub standalone: bool,
    pub sync_timeout_ms: u64,
    /// Panic when a synchronous write times out with TCSes still busy.
    pub panic_on_hang: bool,
    pub invalidate_retries: usize,
}

impl Config for RscConfig {}

impl Default for RscConfig {
    fn default() -> Self {
        Self {
            name: "apps_rsc".to_string(),
            drv_id: 2,
            tcs_offset: 0xd00,
            tcs_config: vec![
                TcsGroupConfig::new(TcsType::Active, 2),
                TcsGroupConfig::new(TcsType::Sleep, 3),
                TcsGroupConfig::new(TcsType::Wake, 3),
                TcsGroupConfig::new(TcsType::Control, 1),
                TcsGroupConfig::new(TcsType::FastPath, 0),
            ],
            standalone: false,
            sync_timeout_ms: 10000,
            panic_on_hang: false,
            invalidate_retries: 100,
        }
    }
}

impl RscConfig {
    pub fn count_of(&self, ty: TcsType) -> usize {
        self.tcs_config
            .iter()
            .filter(|group| group.ty == ty)
            .map(|group| group.count)
            .sum()
    }
}
