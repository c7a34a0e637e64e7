use ironrdp_egfx::pdu::{
    CapabilitiesV103Flags, CapabilitiesV104Flags, CapabilitiesV107Flags, CapabilitiesV10Flags, CapabilitiesV81Flags,
    CapabilitySet, Codec1Type,
};
use tracing::{debug, warn};

use crate::error::VideoInitError;

// RDPGFX_CAPVERSION_* wire values; these order chronologically, which is what
// the "highest version wins" selection relies on.
const CAPVERSION_8: u32 = 0x0008_0004;
const CAPVERSION_81: u32 = 0x0008_0105;
const CAPVERSION_10: u32 = 0x000a_0002;
const CAPVERSION_101: u32 = 0x000a_0100;
const CAPVERSION_102: u32 = 0x000a_0200;
const CAPVERSION_103: u32 = 0x000a_0301;
const CAPVERSION_104: u32 = 0x000a_0400;
const CAPVERSION_105: u32 = 0x000a_0502;
const CAPVERSION_106: u32 = 0x000a_0600;
const CAPVERSION_106_ERR: u32 = 0x000a_0601;
const CAPVERSION_107: u32 = 0x000a_0701;

/// H.264 codec variants of MS-RDPEGFX, in ascending preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AvcCodec {
    Avc420,
    Avc444,
    Avc444v2,
}

impl AvcCodec {
    pub fn codec1_type(self) -> Codec1Type {
        match self {
            AvcCodec::Avc420 => Codec1Type::Avc420,
            AvcCodec::Avc444 => Codec1Type::Avc444,
            AvcCodec::Avc444v2 => Codec1Type::Avc444v2,
        }
    }
}

/// Codec support decoded from one advertised capability set.
///
/// Flag semantics per capability version:
/// - V10.4 through V10.7 report YUV420 support; AVC is available unless
///   `AVC_DISABLED` is set.
/// - V10 through V10.3: AVC available unless `AVC_DISABLED` (V10.1 carries no
///   flags at all). AVC444 is implied by AVC; AVC444v2 from V10.1 on.
/// - V8.1: AVC420 and YUV420 only with `AVC420_ENABLED`.
/// - V8 carries no codec bits.
#[derive(Debug, Clone)]
pub struct CapsInfo {
    pub cap_set: CapabilitySet,
    /// Raw RDPGFX_CAPVERSION value.
    pub version: u32,
    pub avc_supported: bool,
    pub yuv420_supported: bool,
    pub avc444_supported: bool,
    pub avc444v2_supported: bool,
}

impl CapsInfo {
    pub fn from_cap_set(cap_set: &CapabilitySet) -> Self {
        let (version, avc, yuv420) = match cap_set {
            CapabilitySet::V8 { .. } => (CAPVERSION_8, false, false),
            CapabilitySet::V8_1 { flags } => {
                let avc = flags.contains(CapabilitiesV81Flags::AVC420_ENABLED);
                (CAPVERSION_81, avc, avc)
            }
            CapabilitySet::V10 { flags } => (CAPVERSION_10, !flags.contains(CapabilitiesV10Flags::AVC_DISABLED), false),
            CapabilitySet::V10_1 => (CAPVERSION_101, true, false),
            CapabilitySet::V10_2 { flags } => {
                (CAPVERSION_102, !flags.contains(CapabilitiesV10Flags::AVC_DISABLED), false)
            }
            CapabilitySet::V10_3 { flags } => {
                (CAPVERSION_103, !flags.contains(CapabilitiesV103Flags::AVC_DISABLED), false)
            }
            CapabilitySet::V10_4 { flags } => {
                (CAPVERSION_104, !flags.contains(CapabilitiesV104Flags::AVC_DISABLED), true)
            }
            CapabilitySet::V10_5 { flags } => {
                (CAPVERSION_105, !flags.contains(CapabilitiesV104Flags::AVC_DISABLED), true)
            }
            CapabilitySet::V10_6 { flags } => {
                (CAPVERSION_106, !flags.contains(CapabilitiesV104Flags::AVC_DISABLED), true)
            }
            CapabilitySet::V10_6Err { flags } => {
                (CAPVERSION_106_ERR, !flags.contains(CapabilitiesV104Flags::AVC_DISABLED), true)
            }
            CapabilitySet::V10_7 { flags } => {
                (CAPVERSION_107, !flags.contains(CapabilitiesV107Flags::AVC_DISABLED), true)
            }
            CapabilitySet::Unknown(_) => (0, false, false),
        };

        Self {
            cap_set: cap_set.clone(),
            version,
            avc_supported: avc,
            yuv420_supported: yuv420,
            avc444_supported: avc && version >= CAPVERSION_10,
            avc444v2_supported: avc && version >= CAPVERSION_101,
        }
    }

    pub fn supports(&self, codec: AvcCodec) -> bool {
        match codec {
            AvcCodec::Avc420 => self.avc_supported,
            AvcCodec::Avc444 => self.avc444_supported,
            AvcCodec::Avc444v2 => self.avc444v2_supported,
        }
    }
}

/// Outcome of capability negotiation, latched for the whole session.
#[derive(Debug, Clone)]
pub struct CodecSelection {
    pub codec: AvcCodec,
    /// The client capability set echoed back in CAPS_CONFIRM.
    pub cap_set: CapabilitySet,
}

/// Pick a codec and capability set from the client's CAPS_ADVERTISE list.
///
/// The preferred codec is demoted to AVC420 when the local AVC444 encoding
/// path is unavailable. Among capability sets supporting the chosen codec the
/// highest version wins; ties keep advertisement order. When nothing supports
/// a 4:4:4 variant the selection retries with AVC420 before giving up.
pub fn negotiate(
    advertised: &[CapabilitySet],
    preferred: AvcCodec,
    avc444_available: bool,
) -> Result<CodecSelection, VideoInitError> {
    let infos: Vec<CapsInfo> = advertised.iter().map(CapsInfo::from_cap_set).collect();

    for info in &infos {
        debug!(
            version = info.version,
            avc = info.avc_supported,
            yuv420 = info.yuv420_supported,
            avc444 = info.avc444_supported,
            avc444v2 = info.avc444v2_supported,
            "client capability set"
        );
    }

    let mut codec = preferred;
    if codec > AvcCodec::Avc420 && !avc444_available {
        debug!(?preferred, "local AVC444 encoding unavailable, demoting to AVC420");
        codec = AvcCodec::Avc420;
    }

    if let Some(best) = best_match(&infos, codec) {
        debug!(?codec, version = best.version, "selected caps");
        return Ok(CodecSelection {
            codec,
            cap_set: best.cap_set.clone(),
        });
    }

    if codec > AvcCodec::Avc420 {
        if let Some(best) = best_match(&infos, AvcCodec::Avc420) {
            debug!(
                ?codec,
                version = best.version,
                "client lacks 4:4:4 support, selected AVC420 caps"
            );
            return Ok(CodecSelection {
                codec: AvcCodec::Avc420,
                cap_set: best.cap_set.clone(),
            });
        }
    }

    warn!("client does not support H.264 video");
    Err(VideoInitError::NegotiationRefused)
}

fn best_match(infos: &[CapsInfo], codec: AvcCodec) -> Option<&CapsInfo> {
    let mut best: Option<&CapsInfo> = None;
    for info in infos.iter().filter(|info| info.supports(codec)) {
        // Strict comparison keeps the earliest set on equal versions.
        match best {
            Some(current) if info.version <= current.version => {}
            _ => best = Some(info),
        }
    }
    best
}
