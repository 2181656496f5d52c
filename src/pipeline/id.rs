//! Identity types for the fixed line topology.
//!
//! `StageKind` doubles as the station index: the five stages are stored in a
//! `Vec` in declaration order, so `index()` is a direct O(1) lookup.

use crate::error::{LineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the five stages of the line, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Intake,
    Assembler,
    QualityInspection,
    Packaging,
    Shipping,
}

impl StageKind {
    pub const COUNT: usize = 5;

    /// All stages in flow order
    pub const ALL: [StageKind; Self::COUNT] = [
        StageKind::Intake,
        StageKind::Assembler,
        StageKind::QualityInspection,
        StageKind::Packaging,
        StageKind::Shipping,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Display name, also used as the worker name in the registry
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Intake => "Intake",
            StageKind::Assembler => "Assembler",
            StageKind::QualityInspection => "Quality Inspection",
            StageKind::Packaging => "Packaging",
            StageKind::Shipping => "Shipping",
        }
    }

    /// Lower-case key prefix used in statistics snapshots
    pub fn metric_prefix(self) -> &'static str {
        match self {
            StageKind::Intake => "intake",
            StageKind::Assembler => "assembler",
            StageKind::QualityInspection => "quality_inspection",
            StageKind::Packaging => "packaging",
            StageKind::Shipping => "shipping",
        }
    }

    /// Resolve a stage from its display name or metric prefix (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        let needle = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| {
                kind.name().eq_ignore_ascii_case(needle)
                    || kind.metric_prefix().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| LineError::UnknownStation(name.to_string()))
    }

    /// The stage fed by this one's output channel, if any
    pub fn downstream(self) -> Option<StageKind> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_source(self) -> bool {
        self == StageKind::Intake
    }

    pub fn is_terminal(self) -> bool {
        self == StageKind::Shipping
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index into the controller's channel list. Channel `n` joins stage `n` to stage `n + 1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const INVALID: ChannelId = ChannelId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The stage producing into this channel
    pub fn producer(self) -> Option<StageKind> {
        StageKind::ALL.get(self.index()).copied()
    }

    /// The stage consuming from this channel
    pub fn consumer(self) -> Option<StageKind> {
        self.producer().and_then(StageKind::downstream)
    }

    /// Statistics key for this channel's depth, e.g. `intake_assembler_depth`
    pub fn metric_key(self) -> String {
        match (self.producer(), self.consumer()) {
            (Some(from), Some(to)) => {
                format!("{}_{}_depth", from.metric_prefix(), to.metric_prefix())
            }
            _ => format!("channel_{}_depth", self.0),
        }
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ChannelId(INVALID)")
        } else {
            write!(f, "ChannelId({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_index() {
        for (i, kind) in StageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(StageKind::Intake.downstream(), Some(StageKind::Assembler));
        assert_eq!(StageKind::Shipping.downstream(), None);
    }

    #[test]
    fn test_from_name_accepts_display_and_prefix() {
        assert_eq!(
            StageKind::from_name("Quality Inspection").unwrap(),
            StageKind::QualityInspection
        );
        assert_eq!(
            StageKind::from_name("quality_inspection").unwrap(),
            StageKind::QualityInspection
        );
        assert_eq!(StageKind::from_name("shipping").unwrap(), StageKind::Shipping);
        assert!(matches!(
            StageKind::from_name("Painting"),
            Err(LineError::UnknownStation(_))
        ));
    }

    #[test]
    fn test_channel_endpoints() {
        let id = ChannelId(2);
        assert_eq!(id.producer(), Some(StageKind::QualityInspection));
        assert_eq!(id.consumer(), Some(StageKind::Packaging));
        assert_eq!(id.metric_key(), "quality_inspection_packaging_depth");
        assert!(!ChannelId::INVALID.is_valid());
        assert_eq!(ChannelId(4).consumer(), None);
    }
}
