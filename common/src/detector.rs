use crate::{Digi, LayerId};
use strum::{Display, EnumString};

/// Bit of the channel address marking a TRD digi as read out by the 2D electronics.
pub const TRD_2D_FLAG: u32 = 1 << 31;
pub const LAYER_SHIFT: u32 = 16;
pub const LAYER_MASK: u32 = 0xFF;

/// The detector sub-systems digis can come from.
///
/// Parsed from either the short name (`sts`) or the framework name (`kSts`),
/// ignoring case.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[strum(ascii_case_insensitive)]
pub enum DetectorId {
    #[strum(to_string = "bmon", serialize = "kBmon", serialize = "t0", serialize = "kT0")]
    Bmon,
    #[strum(to_string = "sts", serialize = "kSts")]
    Sts,
    #[strum(to_string = "much", serialize = "kMuch")]
    Much,
    #[strum(to_string = "trd", serialize = "kTrd", serialize = "trd1d", serialize = "kTrd1D")]
    Trd,
    #[strum(to_string = "trd2d", serialize = "kTrd2D", serialize = "kTrd2d")]
    Trd2d,
    #[strum(to_string = "tof", serialize = "kTof")]
    Tof,
    #[strum(to_string = "rich", serialize = "kRich")]
    Rich,
    #[strum(to_string = "psd", serialize = "kPsd")]
    Psd,
    #[strum(to_string = "fsd", serialize = "kFsd")]
    Fsd,
}

impl DetectorId {
    /// The detector whose digi array this detector reads from.
    pub fn storage(self) -> DetectorId {
        match self {
            DetectorId::Trd2d => DetectorId::Trd,
            other => other,
        }
    }

    /// True if the detector shares its digi array with a sibling sub-type.
    pub fn has_siblings(self) -> bool {
        matches!(self, DetectorId::Trd | DetectorId::Trd2d)
    }

    /// Whether a digi found in this detector's storage belongs to it.
    pub fn accepts(self, digi: &Digi) -> bool {
        match self {
            DetectorId::Trd => digi.channel_address & TRD_2D_FLAG == 0,
            DetectorId::Trd2d => digi.channel_address & TRD_2D_FLAG != 0,
            _ => true,
        }
    }
}

impl Digi {
    pub fn layer(&self) -> LayerId {
        (self.channel_address >> LAYER_SHIFT) & LAYER_MASK
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_names() {
        assert_eq!(DetectorId::from_str("sts"), Ok(DetectorId::Sts));
        assert_eq!(DetectorId::from_str("kSts"), Ok(DetectorId::Sts));
        assert_eq!(DetectorId::from_str("KTOF"), Ok(DetectorId::Tof));
        assert_eq!(DetectorId::from_str("kTrd2D"), Ok(DetectorId::Trd2d));
        assert_eq!(DetectorId::from_str("kT0"), Ok(DetectorId::Bmon));
        assert!(DetectorId::from_str("kCalorimeter").is_err());
        assert!(DetectorId::from_str("").is_err());
    }

    #[test]
    fn display_is_short_name() {
        assert_eq!(DetectorId::Trd2d.to_string(), "trd2d");
        assert_eq!(DetectorId::Bmon.to_string(), "bmon");
    }

    #[test]
    fn trd_subtypes_share_storage() {
        assert_eq!(DetectorId::Trd2d.storage(), DetectorId::Trd);
        assert_eq!(DetectorId::Trd.storage(), DetectorId::Trd);
        assert_eq!(DetectorId::Tof.storage(), DetectorId::Tof);
        assert!(DetectorId::Trd2d.has_siblings());
        assert!(!DetectorId::Sts.has_siblings());

        let one_d = Digi::new(1.0, 0x0003_0001, 0);
        let two_d = Digi::new(1.0, TRD_2D_FLAG | 0x0003_0001, 0);
        assert!(DetectorId::Trd.accepts(&one_d));
        assert!(!DetectorId::Trd.accepts(&two_d));
        assert!(DetectorId::Trd2d.accepts(&two_d));
        assert!(!DetectorId::Trd2d.accepts(&one_d));
        assert!(DetectorId::Sts.accepts(&two_d));
    }

    #[test]
    fn layer_from_address() {
        assert_eq!(Digi::new(0.0, 0x0005_1234, 0).layer(), 5);
        assert_eq!(Digi::new(0.0, TRD_2D_FLAG | 0x00FF_0000, 0).layer(), 0xFF);
    }
}
