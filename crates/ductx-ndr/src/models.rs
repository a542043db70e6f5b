//! Radio model definitions.
//!
//! Each supported radio is described by an [`NdrRadioModel`] capturing the
//! transmit-side hardware limits the engine validates against: how many
//! DUCs and transmitters exist, how many DUC groups can be formed, and how
//! deep each DUC's sample buffer is.
//!
//! | Model   | model_id | DUCs | Transmitters | Groups | Buffer (samples) |
//! |---------|----------|------|--------------|--------|------------------|
//! | NDR651  | `ndr651` | 8    | 2            | 4      | 67 108 864       |
//!
//! Test rigs and bench setups that do not match a catalogued model can use
//! [`custom`].

use ductx_core::{Error, Result};

/// Static model definition for a networked transmitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdrRadioModel {
    /// Human-readable model name (e.g. "NDR651").
    pub name: &'static str,
    /// Machine-readable model identifier (e.g. "ndr651").
    pub model_id: &'static str,
    /// Number of DUCs, numbered from 1.
    pub duc_count: u8,
    /// Number of physical transmitters, numbered from 1.
    pub tx_count: u8,
    /// Number of DUC groups, numbered from 1.
    pub group_count: u8,
    /// Depth of each DUC's transmit buffer in samples.
    pub duc_buffer_samples: u32,
}

impl NdrRadioModel {
    /// Check that `channel` names a DUC on this model.
    pub fn check_channel(&self, channel: u8) -> Result<()> {
        if channel == 0 || channel > self.duc_count {
            return Err(Error::InvalidParameter(format!(
                "DUC {} out of range for {} (1..={})",
                channel, self.name, self.duc_count
            )));
        }
        Ok(())
    }

    /// Check that `group` names a DUC group on this model.
    pub fn check_group(&self, group: u8) -> Result<()> {
        if group == 0 || group > self.group_count {
            return Err(Error::InvalidParameter(format!(
                "DUC group {} out of range for {} (1..={})",
                group, self.name, self.group_count
            )));
        }
        Ok(())
    }

    /// Check that `index` names a transmitter on this model.
    pub fn check_transmitter(&self, index: u8) -> Result<()> {
        if index == 0 || index > self.tx_count {
            return Err(Error::InvalidParameter(format!(
                "transmitter {} out of range for {} (1..={})",
                index, self.name, self.tx_count
            )));
        }
        Ok(())
    }

    /// Check that every bit of `mask` names a transmitter on this model.
    pub fn check_tx_mask(&self, mask: u8) -> Result<()> {
        let allowed = if self.tx_count >= 8 {
            u8::MAX
        } else {
            (1u8 << self.tx_count) - 1
        };
        if mask & !allowed != 0 {
            return Err(Error::InvalidParameter(format!(
                "tx mask {:#04x} names transmitters beyond {} on {}",
                mask, self.tx_count, self.name
            )));
        }
        Ok(())
    }
}

/// NDR651 model definition.
///
/// Eight wideband/narrowband DUCs feeding two transmitters, with four DUC
/// groups for synchronized start.
pub fn ndr651() -> NdrRadioModel {
    NdrRadioModel {
        name: "NDR651",
        model_id: "ndr651",
        duc_count: 8,
        tx_count: 2,
        group_count: 4,
        duc_buffer_samples: 67_108_864,
    }
}

/// A model with arbitrary limits, for bench setups and tests.
pub fn custom(duc_count: u8, duc_buffer_samples: u32) -> NdrRadioModel {
    NdrRadioModel {
        name: "custom",
        model_id: "custom",
        duc_count,
        tx_count: 2,
        group_count: 4,
        duc_buffer_samples,
    }
}

/// Return all catalogued models.
pub fn all_models() -> Vec<NdrRadioModel> {
    vec![ndr651()]
}

/// Look up a catalogued model by its identifier.
pub fn by_id(model_id: &str) -> Option<NdrRadioModel> {
    all_models().into_iter().find(|m| m.model_id == model_id)
}
