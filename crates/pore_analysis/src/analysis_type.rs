//! Per-timestep analysis bitmask.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::error::{AnalysisError, Result};

/// Set of analysis actions requested for one timestep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AnalysisType(u32);

impl AnalysisType {
  pub const NONE: Self = Self(0x00);
  pub const COPY_PHASE_INDICATOR: Self = Self(0x01);
  pub const COPY_SIM_STATE: Self = Self(0x02);
  pub const COMPUTE_AVERAGES: Self = Self(0x04);
  pub const CREATE_RESTART: Self = Self(0x08);
  pub const WRITE_VIS: Self = Self(0x10);
  pub const IDENTIFY_BLOBS: Self = Self(0x20);

  const ALL_BITS: u32 = 0x3F;

  const NAMES: [(Self, &'static str); 6] = [
    (Self::COPY_PHASE_INDICATOR, "CopyPhaseIndicator"),
    (Self::COPY_SIM_STATE, "CopySimState"),
    (Self::COMPUTE_AVERAGES, "ComputeAverages"),
    (Self::CREATE_RESTART, "CreateRestart"),
    (Self::WRITE_VIS, "WriteVis"),
    (Self::IDENTIFY_BLOBS, "IdentifyBlobs"),
  ];

  /// Build from raw bits, rejecting bits outside the known flags.
  pub fn from_bits(bits: u32) -> Result<Self> {
    if bits & !Self::ALL_BITS != 0 {
      return Err(AnalysisError::InvalidAnalysisType(bits));
    }
    Ok(Self(bits))
  }

  #[inline]
  pub fn bits(self) -> u32 {
    self.0
  }

  #[inline]
  pub fn is_none(self) -> bool {
    self.0 == 0
  }

  /// True if any flag of `other` is set in `self`.
  #[inline]
  pub fn matches(self, other: Self) -> bool {
    self.0 & other.0 != 0
  }

  /// True if every flag of `other` is set in `self`.
  #[inline]
  pub fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  /// Whether any consumer needs a host copy of the phase field.
  pub fn needs_phase(self) -> bool {
    self.matches(
      Self::COPY_PHASE_INDICATOR
        | Self::COMPUTE_AVERAGES
        | Self::COPY_SIM_STATE
        | Self::IDENTIFY_BLOBS,
    )
  }
}

impl BitOr for AnalysisType {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl BitOrAssign for AnalysisType {
  fn bitor_assign(&mut self, rhs: Self) {
    self.0 |= rhs.0;
  }
}

impl BitAnd for AnalysisType {
  type Output = Self;

  fn bitand(self, rhs: Self) -> Self {
    Self(self.0 & rhs.0)
  }
}

impl fmt::Display for AnalysisType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_none() {
      return write!(f, "None");
    }
    let mut first = true;
    for (flag, name) in Self::NAMES {
      if self.contains(flag) {
        if !first {
          write!(f, "|")?;
        }
        write!(f, "{name}")?;
        first = false;
      }
    }
    Ok(())
  }
}
