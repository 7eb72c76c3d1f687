use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::CutoverError;
use crate::events::Direction;

/// One of the two physical backends behind the dual-write pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Source,
    Target,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Source => write!(f, "src"),
            Backend::Target => write!(f, "dst"),
        }
    }
}

/// Write-routing mode of the dual-write pool.
///
/// A migration walks through these in order: `SrcOnly` → `SrcFirst` →
/// `DstFirst` → `DstOnly`. The "first" patterns write to both backends; only
/// the authoritative side may fail a request.
#[repr(u8)]
#[derive(
    AsRefStr,
    EnumIter,
    EnumString,
    Display,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Pattern {
    SrcOnly = 0,
    SrcFirst = 1,
    DstFirst = 2,
    DstOnly = 3,
}

impl Pattern {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, CutoverError> {
        match value {
            0 => Ok(Pattern::SrcOnly),
            1 => Ok(Pattern::SrcFirst),
            2 => Ok(Pattern::DstFirst),
            3 => Ok(Pattern::DstOnly),
            _ => Err(CutoverError::UnknownPattern(format!("raw value {}", value))),
        }
    }

    /// Parse a pattern name, reporting unknown names as a configuration error
    pub fn parse(name: &str) -> Result<Self, CutoverError> {
        Pattern::from_str(name.trim()).map_err(|_| CutoverError::UnknownPattern(name.to_owned()))
    }

    /// The backend whose result decides the outcome of a call
    pub fn authoritative(&self) -> Backend {
        match self {
            Pattern::SrcOnly | Pattern::SrcFirst => Backend::Source,
            Pattern::DstFirst | Pattern::DstOnly => Backend::Target,
        }
    }

    /// The best-effort secondary backend, present only while dual-writing
    pub fn shadow(&self) -> Option<Backend> {
        match self {
            Pattern::SrcFirst => Some(Backend::Target),
            Pattern::DstFirst => Some(Backend::Source),
            Pattern::SrcOnly | Pattern::DstOnly => None,
        }
    }

    /// Which side a validation started under this pattern treats as base
    pub fn direction(&self) -> Direction {
        match self.authoritative() {
            Backend::Source => Direction::Src,
            Backend::Target => Direction::Dst,
        }
    }
}

/// Lock-free holder for the active pattern.
///
/// Reads happen on every statement the pool routes; writes are rare and are
/// serialized by the scheduler.
#[derive(Debug)]
pub struct PatternCell {
    raw: AtomicU8,
}

impl PatternCell {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            raw: AtomicU8::new(pattern.as_u8()),
        }
    }

    pub fn load(&self) -> Result<Pattern, CutoverError> {
        Pattern::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Swap in a new pattern, returning the previous raw value decoded
    pub fn store(&self, pattern: Pattern) -> Result<Pattern, CutoverError> {
        Pattern::from_u8(self.raw.swap(pattern.as_u8(), Ordering::AcqRel))
    }

    #[cfg(test)]
    pub(crate) fn store_raw(&self, raw: u8) {
        self.raw.store(raw, Ordering::Release);
    }
}
