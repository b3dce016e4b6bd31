//! Channel identities, protocol bytes and upload/measurement ordering.

use std::collections::HashMap;
use std::fmt;

use log::warn;
use once_cell::sync::Lazy;

use crate::errors::{CalError, Result};

// ============================================================================
// EQ engine variant
// ============================================================================

/// Room-correction engine of the receiver, from the calibration file's
/// numeric `eqType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqVariant {
    MultEq,
    Xt,
    Xt32,
}

impl EqVariant {
    pub fn from_eq_type(eq_type: i64) -> Result<Self> {
        match eq_type {
            0 => Ok(EqVariant::MultEq),
            1 => Ok(EqVariant::Xt),
            2 => Ok(EqVariant::Xt32),
            other => Err(CalError::Config(format!("unknown eqType {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EqVariant::MultEq => "MultEQ",
            EqVariant::Xt => "XT",
            EqVariant::Xt32 => "XT32",
        }
    }

    /// Coefficient count a non-XT32 receiver expects, if fixed.
    pub fn expected_float_count(self, subwoofer: bool) -> Option<usize> {
        match (self, subwoofer) {
            (EqVariant::Xt, _) => Some(512),
            (EqVariant::MultEq, true) => Some(512),
            (EqVariant::MultEq, false) => Some(128),
            (EqVariant::Xt32, _) => None,
        }
    }
}

impl fmt::Display for EqVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Channel byte table
// ============================================================================

/// Protocol bytes for one channel under each mapping family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBytes {
    pub eq2: Option<u8>,
    pub neq2: Option<u8>,
    pub griffin: Option<u8>,
}

const fn same(b: u8) -> ChannelBytes {
    ChannelBytes {
        eq2: Some(b),
        neq2: Some(b),
        griffin: Some(b),
    }
}

const fn split(eq2: Option<u8>, neq2: Option<u8>, griffin: Option<u8>) -> ChannelBytes {
    ChannelBytes { eq2, neq2, griffin }
}

static CHANNEL_TABLE: Lazy<HashMap<&'static str, ChannelBytes>> = Lazy::new(|| {
    HashMap::from([
        ("FL", same(0x00)),
        ("C", same(0x01)),
        ("FR", same(0x02)),
        ("FWR", same(0x15)),
        ("SRA", same(0x03)),
        ("SRB", split(None, Some(0x07), None)),
        ("SBR", same(0x07)),
        ("SBL", same(0x08)),
        ("SLB", split(None, Some(0x0d), None)),
        ("SLA", same(0x0c)),
        ("FWL", same(0x1c)),
        ("FHL", same(0x10)),
        ("CH", same(0x12)),
        ("FHR", same(0x14)),
        ("TFR", same(0x04)),
        ("TMR", same(0x05)),
        ("TRR", same(0x06)),
        ("SHR", same(0x16)),
        ("RHR", split(Some(0x13), Some(0x17), Some(0x13))),
        ("TS", same(0x1d)),
        ("RHL", split(Some(0x11), Some(0x1a), Some(0x11))),
        ("SHL", same(0x1b)),
        ("TRL", same(0x09)),
        ("TML", same(0x0a)),
        ("TFL", same(0x0b)),
        ("FDL", same(0x1a)),
        ("FDR", same(0x17)),
        ("SDR", same(0x18)),
        ("BDR", split(Some(0x18), Some(0x00), Some(0x1f))),
        ("SDL", same(0x19)),
        ("BDL", split(Some(0x19), Some(0x00), Some(0x20))),
        ("SW1", same(0x0d)),
        ("SW2", same(0x0e)),
        ("SW3", same(0x21)),
        ("SW4", same(0x22)),
    ])
});

/// Table row for a channel id, if the id is known.
pub fn lookup(id: &str) -> Option<ChannelBytes> {
    CHANNEL_TABLE.get(id).copied()
}

/// Resolve the protocol byte for `id` on a receiver with the given engine.
///
/// Lookup order: the Griffin column when requested, then the variant's own
/// column (`eq2` for XT32, `neq2` otherwise), then the other column.
///
/// # Errors
///
/// `NoChannelMapping` when the id is unknown or every column is empty.
pub fn channel_byte(id: &str, variant: EqVariant, griffin: bool) -> Result<u8> {
    let no_mapping = || CalError::NoChannelMapping {
        channel: id.to_string(),
        variant: variant.name().to_string(),
    };
    let entry = lookup(id).ok_or_else(no_mapping)?;

    if griffin {
        if let Some(b) = entry.griffin {
            return Ok(b);
        }
        warn!("no Griffin channel byte for {id}, falling back to standard mapping");
    }

    let (primary, secondary) = match variant {
        EqVariant::Xt32 => (entry.eq2, entry.neq2),
        EqVariant::Xt | EqVariant::MultEq => (entry.neq2, entry.eq2),
    };
    if let Some(b) = primary {
        return Ok(b);
    }
    warn!("{variant} channel byte for {id} is unmapped, falling back");
    secondary.ok_or_else(no_mapping)
}

/// Map a subwoofer layout alias to its SWn slot; other ids are unchanged.
pub fn normalize_channel_id(id: &str) -> &str {
    match id {
        "SWLFE" | "SWLFE2SP" | "SWLEFT2SP" | "SWFRONT2SP" | "SWLFE3SP" | "SWLEFT3SP"
        | "SWFRONTLEFT3SP" | "SWLFE4SP" | "SWFRONTLEFT4SP" | "SWMIX1" => "SW1",
        "SWRIGHT2SP" | "SWBACK2SP" | "SWRIGHT3SP" | "SWFRONTRIGHT3SP" | "SWFRONTRIGHT4SP"
        | "SWMIX2" => "SW2",
        "SWREAR3SP" | "SWBACKLEFT4SP" | "SWMIX3" => "SW3",
        "SWBACKRIGHT4SP" | "SWMIX4" => "SW4",
        other => other,
    }
}

pub fn is_subwoofer(id: &str) -> bool {
    id.starts_with("SW") || id == "LFE"
}

// ============================================================================
// Ordering
// ============================================================================

/// One channel scheduled for coefficient upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSlot {
    /// Id as the receiver reported it.
    pub id: String,
    /// Id after alias normalization.
    pub mapped_id: String,
    pub byte: u8,
}

const FLOOR: [&str; 7] = ["FL", "C", "FR", "SLA", "SRA", "SBL", "SBR"];
const FRONT_WIDE: [&str; 2] = ["FWL", "FWR"];
const SUBWOOFERS: [&str; 4] = ["SW1", "SW2", "SW3", "SW4"];

/// Upload order: floor channels, other channels, front wides, subwoofers;
/// each group sorted by protocol byte. Channels without a byte are skipped.
pub fn transfer_order(active: &[String], variant: EqVariant, griffin: bool) -> Vec<ChannelSlot> {
    let mut groups: [Vec<ChannelSlot>; 4] = Default::default();
    for id in active {
        let upper = id.to_ascii_uppercase();
        let mapped = normalize_channel_id(&upper).to_string();
        let byte = match channel_byte(&mapped, variant, griffin) {
            Ok(b) => b,
            Err(e) => {
                warn!("skipping channel {id}: {e}");
                continue;
            }
        };
        let group = if FLOOR.contains(&mapped.as_str()) {
            0
        } else if SUBWOOFERS.contains(&mapped.as_str()) {
            3
        } else if FRONT_WIDE.contains(&mapped.as_str()) {
            2
        } else {
            1
        };
        groups[group].push(ChannelSlot {
            id: id.clone(),
            mapped_id: mapped,
            byte,
        });
    }
    groups
        .into_iter()
        .flat_map(|mut g| {
            g.sort_by_key(|slot| slot.byte);
            g
        })
        .collect()
}

/// Fixed order in which the receiver measures channels.
pub const MEASUREMENT_ORDER: [&str; 34] = [
    "FL", "C", "FR", "FWR", "SRA", "SBR", "SBL", "SLA", "FWL", "CH", "FHR", "TFR", "FDR", "TMR",
    "TRR", "SHR", "RHR", "SDR", "BDR", "BDL", "SDL", "RHL", "SHL", "TRL", "TML", "FDL", "TFL",
    "FHL", "TS", "LFE", "SW1", "SW2", "SW3", "SW4",
];

/// Arrange detected channels in measurement order; unknown ids go last in
/// their original order.
pub fn measurement_order(detected: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = MEASUREMENT_ORDER
        .iter()
        .filter(|known| detected.iter().any(|d| d.as_str() == **known))
        .map(|s| s.to_string())
        .collect();
    for id in detected {
        if !ordered.contains(id) {
            warn!("channel {id} is not in the known measurement order, appending");
            ordered.push(id.clone());
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn eq_type_parsing() {
        assert_eq!(EqVariant::from_eq_type(2).unwrap(), EqVariant::Xt32);
        assert!(EqVariant::from_eq_type(7).is_err());
    }

    #[test]
    fn variant_columns_and_fallbacks() {
        assert_eq!(channel_byte("RHR", EqVariant::Xt32, false).unwrap(), 0x13);
        assert_eq!(channel_byte("RHR", EqVariant::Xt, false).unwrap(), 0x17);
        assert_eq!(channel_byte("BDR", EqVariant::MultEq, true).unwrap(), 0x1f);
        // SRB has no eq2 or griffin byte; both fall back to neq2.
        assert_eq!(channel_byte("SRB", EqVariant::Xt32, false).unwrap(), 0x07);
        assert_eq!(channel_byte("SLB", EqVariant::Xt32, true).unwrap(), 0x0d);
    }

    #[test]
    fn unknown_channel_has_no_mapping() {
        match channel_byte("ZZ", EqVariant::Xt, false) {
            Err(CalError::NoChannelMapping { channel, variant }) => {
                assert_eq!(channel, "ZZ");
                assert_eq!(variant, "XT");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn subwoofer_aliases() {
        assert_eq!(normalize_channel_id("SWLFE"), "SW1");
        assert_eq!(normalize_channel_id("SWBACK2SP"), "SW2");
        assert_eq!(normalize_channel_id("SWREAR3SP"), "SW3");
        assert_eq!(normalize_channel_id("SWMIX4"), "SW4");
        assert_eq!(normalize_channel_id("FL"), "FL");
        assert!(is_subwoofer("SW2") && is_subwoofer("LFE") && !is_subwoofer("FL"));
    }

    #[test]
    fn transfer_groups_and_sorting() {
        let active = ids(&["SWMIX2", "FWL", "SLA", "FHL", "C", "SWLFE", "FL", "TFR", "FWR", "XX"]);
        let order: Vec<String> = transfer_order(&active, EqVariant::Xt32, false)
            .into_iter()
            .map(|s| s.mapped_id)
            .collect();
        assert_eq!(
            order,
            ids(&["FL", "C", "SLA", "TFR", "FHL", "FWR", "FWL", "SW1", "SW2"])
        );
    }

    #[test]
    fn transfer_keeps_reported_id() {
        let slots = transfer_order(&ids(&["SWLFE"]), EqVariant::Xt, false);
        assert_eq!(slots[0].id, "SWLFE");
        assert_eq!(slots[0].mapped_id, "SW1");
        assert_eq!(slots[0].byte, 0x0d);
    }

    #[test]
    fn measurement_order_appends_unknown() {
        let detected = ids(&["SW1", "NEW", "FR", "FL"]);
        assert_eq!(measurement_order(&detected), ids(&["FL", "FR", "SW1", "NEW"]));
        assert_eq!(MEASUREMENT_ORDER.len(), 34);
    }

    #[test]
    fn expected_counts() {
        assert_eq!(EqVariant::MultEq.expected_float_count(false), Some(128));
        assert_eq!(EqVariant::MultEq.expected_float_count(true), Some(512));
        assert_eq!(EqVariant::Xt.expected_float_count(false), Some(512));
        assert_eq!(EqVariant::Xt32.expected_float_count(true), None);
    }
}
